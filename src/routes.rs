//! The route registry: actions, pages, and the catalogue walk.
//!
//! Routes form a tree: pages may nest actions and further pages under
//! sub-slugs, and the fully qualified slug of a leaf joins the path with
//! `/`. Initialisation flattens the tree into the `actions[]` and
//! `groups[]` definitions reported to the dashboard, plus handler maps
//! keyed by fully qualified slug.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::{
    context::{ActionContext, PageContext},
    page::Layout,
    payload::Payload,
    transaction::IoClient,
    wire::{AccessControl, ActionDefinition, PageDefinition},
};

/// User handler for one action invocation.
pub type ActionHandler = Arc<
    dyn Fn(IoClient, ActionContext) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync,
>;

/// User handler producing a page layout.
pub type PageHandler =
    Arc<dyn Fn(IoClient, PageContext) -> BoxFuture<'static, anyhow::Result<Layout>> + Send + Sync>;

/// A named operator-facing procedure.
#[derive(Clone)]
pub struct Action {
    /// Display name.
    pub name: Option<String>,
    /// Display description.
    pub description: Option<String>,
    /// Whether the dashboard may run it without an attached client.
    pub backgroundable: bool,
    /// Hidden from the catalogue listing.
    pub unlisted: bool,
    /// Access policy.
    pub access: Option<AccessControl>,
    handler: ActionHandler,
}

impl Action {
    /// Create an action from its handler.
    #[must_use]
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(IoClient, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        Self {
            name: None,
            description: None,
            backgroundable: false,
            unlisted: false,
            access: None,
            handler: Arc::new(move |io, ctx| Box::pin(handler(io, ctx))),
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the display description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Allow the dashboard to run the action without an attached client.
    #[must_use]
    pub const fn backgroundable(mut self) -> Self {
        self.backgroundable = true;
        self
    }

    /// Hide the action from the catalogue listing.
    #[must_use]
    pub const fn unlisted(mut self) -> Self {
        self.unlisted = true;
        self
    }

    /// Restrict who may run the action.
    #[must_use]
    pub fn with_access(mut self, access: AccessControl) -> Self {
        self.access = Some(access);
        self
    }

    pub(crate) fn handler(&self) -> ActionHandler { Arc::clone(&self.handler) }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("backgroundable", &self.backgroundable)
            .field("unlisted", &self.unlisted)
            .finish_non_exhaustive()
    }
}

/// A named layout composition, optionally nesting further routes.
#[derive(Clone)]
pub struct Page {
    /// Display name.
    pub name: String,
    /// Display description.
    pub description: Option<String>,
    /// Hidden from the catalogue listing.
    pub unlisted: bool,
    /// Access policy.
    pub access: Option<AccessControl>,
    handler: Option<PageHandler>,
    routes: BTreeMap<String, Route>,
}

impl Page {
    /// Create a page group with no layout of its own.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            unlisted: false,
            access: None,
            handler: None,
            routes: BTreeMap::new(),
        }
    }

    /// Install the layout handler.
    #[must_use]
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(IoClient, PageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Layout>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |io, ctx| Box::pin(handler(io, ctx))));
        self
    }

    /// Set the display description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Hide the page from the catalogue listing.
    #[must_use]
    pub const fn unlisted(mut self) -> Self {
        self.unlisted = true;
        self
    }

    /// Restrict who may view the page.
    #[must_use]
    pub fn with_access(mut self, access: AccessControl) -> Self {
        self.access = Some(access);
        self
    }

    /// Nest a route under this page.
    #[must_use]
    pub fn route(mut self, slug: impl Into<String>, route: impl Into<Route>) -> Self {
        let _ = self.routes.insert(slug.into(), route.into());
        self
    }

    pub(crate) fn handler(&self) -> Option<PageHandler> { self.handler.clone() }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("name", &self.name)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Either an action or a nested page.
#[derive(Debug, Clone)]
pub enum Route {
    /// A leaf action.
    Action(Action),
    /// A nested page group.
    Page(Page),
}

impl From<Action> for Route {
    fn from(action: Action) -> Self { Self::Action(action) }
}

impl From<Page> for Route {
    fn from(page: Page) -> Self { Self::Page(page) }
}

/// The host's mutable route tree.
#[derive(Debug, Clone, Default)]
pub struct RouteMap {
    routes: BTreeMap<String, Route>,
}

/// Flattened view of the tree, produced for `INITIALIZE_HOST`.
#[derive(Default)]
pub(crate) struct Catalogue {
    pub(crate) actions: Vec<ActionDefinition>,
    pub(crate) groups: Vec<PageDefinition>,
    pub(crate) action_handlers: HashMap<String, ActionHandler>,
    pub(crate) page_handlers: HashMap<String, PageHandler>,
}

impl RouteMap {
    /// Insert or replace a route at a `/`-separated slug path.
    ///
    /// Intermediate segments must already exist as pages; a missing
    /// segment fails the insert.
    pub fn add(&mut self, slug: &str, route: impl Into<Route>) -> Result<(), UnknownSlug> {
        let (parent, leaf) = match slug.rsplit_once('/') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, slug),
        };
        let target = match parent {
            None => &mut self.routes,
            Some(path) => &mut self.page_at(path)?.routes,
        };
        let _ = target.insert(leaf.to_owned(), route.into());
        Ok(())
    }

    /// Remove the route at a `/`-separated slug path, when present.
    pub fn remove(&mut self, slug: &str) {
        let (parent, leaf) = match slug.rsplit_once('/') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, slug),
        };
        let target = match parent {
            None => Some(&mut self.routes),
            Some(path) => self.page_at(path).ok().map(|page| &mut page.routes),
        };
        if let Some(target) = target {
            let _ = target.remove(leaf);
        }
    }

    fn page_at(&mut self, path: &str) -> Result<&mut Page, UnknownSlug> {
        let mut current = &mut self.routes;
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            match current.get_mut(segment) {
                Some(Route::Page(page)) => {
                    if segments.peek().is_none() {
                        return Ok(page);
                    }
                    current = &mut page.routes;
                }
                _ => return Err(UnknownSlug(path.to_owned())),
            }
        }
        Err(UnknownSlug(path.to_owned()))
    }

    /// Flatten the tree for initialisation.
    pub(crate) fn walk(&self) -> Catalogue {
        let mut catalogue = Catalogue::default();
        for (slug, route) in &self.routes {
            match route {
                Route::Action(action) => add_action(&mut catalogue, None, slug, action),
                Route::Page(page) => walk_page(&mut catalogue, slug, page),
            }
        }
        catalogue
    }
}

/// A slug path that does not name an existing page.
#[derive(Debug, thiserror::Error)]
#[error("no page exists at slug {0}")]
pub struct UnknownSlug(pub String);

fn add_action(catalogue: &mut Catalogue, group_slug: Option<&str>, slug: &str, action: &Action) {
    let full_slug = group_slug.map_or_else(|| slug.to_owned(), |group| format!("{group}/{slug}"));
    catalogue.actions.push(ActionDefinition {
        group_slug: group_slug.map(str::to_owned),
        slug: slug.to_owned(),
        name: action.name.clone(),
        description: action.description.clone(),
        backgroundable: action.backgroundable,
        unlisted: action.unlisted,
        access: action.access.clone(),
    });
    let _ = catalogue.action_handlers.insert(full_slug, action.handler());
}

fn walk_page(catalogue: &mut Catalogue, group_slug: &str, page: &Page) {
    catalogue.groups.push(PageDefinition {
        slug: group_slug.to_owned(),
        name: page.name.clone(),
        description: page.description.clone(),
        has_handler: page.handler.is_some(),
        unlisted: page.unlisted,
        access: page.access.clone(),
    });
    if let Some(handler) = page.handler() {
        let _ = catalogue.page_handlers.insert(group_slug.to_owned(), handler);
    }
    for (slug, route) in &page.routes {
        match route {
            Route::Action(action) => add_action(catalogue, Some(group_slug), slug, action),
            Route::Page(nested) => {
                walk_page(catalogue, &format!("{group_slug}/{slug}"), nested);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn noop_action() -> Action {
        Action::new(|_io, _ctx| async move { Ok(Payload::Null) })
    }

    fn registry() -> RouteMap {
        let mut routes = RouteMap::default();
        routes.add("hello", noop_action().with_name("Hello")).unwrap();
        routes
            .add(
                "billing",
                Page::new("Billing")
                    .route("refund", noop_action().backgroundable())
                    .route("credits", Page::new("Credits").route("grant", noop_action())),
            )
            .unwrap();
        routes
    }

    #[rstest]
    fn walk_flattens_nested_pages() {
        let catalogue = registry().walk();

        let slugs: Vec<_> = catalogue
            .actions
            .iter()
            .map(|a| (a.group_slug.clone(), a.slug.clone()))
            .collect();
        assert!(slugs.contains(&(None, "hello".to_owned())));
        assert!(slugs.contains(&(Some("billing".to_owned()), "refund".to_owned())));
        assert!(slugs.contains(&(Some("billing/credits".to_owned()), "grant".to_owned())));

        let groups: Vec<_> = catalogue.groups.iter().map(|g| g.slug.clone()).collect();
        assert_eq!(groups, vec!["billing".to_owned(), "billing/credits".to_owned()]);

        assert!(catalogue.action_handlers.contains_key("hello"));
        assert!(catalogue.action_handlers.contains_key("billing/refund"));
        assert!(catalogue.action_handlers.contains_key("billing/credits/grant"));
    }

    #[rstest]
    fn add_by_path_reaches_nested_pages() {
        let mut routes = registry();
        routes.add("billing/void", noop_action()).unwrap();
        assert!(routes.walk().action_handlers.contains_key("billing/void"));

        assert!(routes.add("missing/child", noop_action()).is_err());
    }

    #[rstest]
    fn remove_by_path_is_silent_on_missing_slugs() {
        let mut routes = registry();
        routes.remove("billing/refund");
        assert!(!routes.walk().action_handlers.contains_key("billing/refund"));

        routes.remove("billing/refund");
        routes.remove("nope/nothing");
    }

    #[rstest]
    fn pages_report_their_handlers() {
        let mut routes = RouteMap::default();
        routes
            .add(
                "dash",
                Page::new("Dash").with_handler(|_io, _ctx| async move {
                    Ok(crate::page::Layout::default())
                }),
            )
            .unwrap();
        let catalogue = routes.walk();
        assert!(catalogue.groups[0].has_handler);
        assert!(catalogue.page_handlers.contains_key("dash"));
    }
}
