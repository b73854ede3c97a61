#![allow(missing_docs, reason = "integration tests")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]
#![allow(clippy::expect_used, reason = "test code can panic")]

use std::{cell::RefCell, sync::Arc};

use interval_host::transaction::{LoadingOptions, LoadingState, TransactionLoadingState};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tokio::{runtime::Runtime, sync::mpsc};

struct LoadingWorld {
    rt: Runtime,
    loading: TransactionLoadingState,
    rx: RefCell<mpsc::UnboundedReceiver<LoadingState>>,
}

impl LoadingWorld {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender: interval_host::transaction::loading::LoadingSender =
            Arc::new(move |state: LoadingState| {
                let tx = tx.clone();
                Box::pin(async move {
                    tx.send(state)
                        .map_err(|_| anyhow::anyhow!("loading channel closed"))?;
                    Ok(())
                })
            });
        Self {
            rt: Runtime::new().expect("runtime"),
            loading: TransactionLoadingState::new(sender),
            rx: RefCell::new(rx),
        }
    }

    fn transmitted(&self) -> Vec<LoadingState> {
        let mut states = Vec::new();
        while let Ok(state) = self.rx.borrow_mut().try_recv() {
            states.push(state);
        }
        states
    }
}

#[fixture]
fn world() -> LoadingWorld { LoadingWorld::new() }

#[given("a loading state handle")]
fn given_handle(world: &LoadingWorld) { let _ = world; }

#[when("I start loading with {count} items in queue")]
fn when_start_with_queue(world: &LoadingWorld, count: u64) {
    world.rt.block_on(world.loading.start(LoadingOptions {
        items_in_queue: Some(count),
        ..LoadingOptions::default()
    }));
}

#[allow(clippy::needless_pass_by_value)]
#[when("I start loading titled \"{title}\"")]
fn when_start_titled(world: &LoadingWorld, title: String) {
    world.rt.block_on(world.loading.start(LoadingOptions::title(title)));
}

#[when("I update loading with no changes")]
fn when_bare_update(world: &LoadingWorld) {
    world.rt.block_on(world.loading.update(LoadingOptions::default()));
}

#[when("I complete one item")]
fn when_complete_one(world: &LoadingWorld) {
    world.rt.block_on(world.loading.complete_one());
}

#[then("the transmitted items completed is {expected}")]
fn then_items_completed(world: &LoadingWorld, expected: u64) {
    let states = world.transmitted();
    let last = states.last().expect("a state was transmitted");
    assert_eq!(last.items_completed, Some(expected));
}

#[then("the last two transmitted states are identical")]
fn then_last_two_identical(world: &LoadingWorld) {
    let states = world.transmitted();
    assert!(states.len() >= 2, "expected at least two transmissions");
    assert_eq!(states[states.len() - 2], states[states.len() - 1]);
}

#[then("only one state was transmitted")]
fn then_only_one(world: &LoadingWorld) {
    assert_eq!(world.transmitted().len(), 1);
}

#[scenario(path = "tests/features/loading_state.feature", index = 0)]
fn queue_resets_progress(world: LoadingWorld) { let _ = world; }

#[scenario(path = "tests/features/loading_state.feature", index = 1)]
fn bare_update_repeats_state(world: LoadingWorld) { let _ = world; }

#[scenario(path = "tests/features/loading_state.feature", index = 2)]
fn complete_without_queue(world: LoadingWorld) { let _ = world; }
