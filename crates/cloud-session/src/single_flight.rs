use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::CloudError;

type Flight<T> = Shared<BoxFuture<'static, Result<T, CloudError>>>;

enum State<T> {
    Idle,
    InFlight(Flight<T>),
}

/// At most one operation at a time; callers arriving while it runs share its outcome.
pub(crate) struct SingleFlight<T> {
    state: Mutex<State<T>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
        }
    }

    pub async fn run<F, Fut>(&self, start: F) -> Result<T, CloudError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CloudError>> + Send + 'static,
    {
        let flight = {
            let mut state = self.lock();
            match &*state {
                State::InFlight(flight) => flight.clone(),
                State::Idle => {
                    let flight = start().boxed().shared();
                    *state = State::InFlight(flight.clone());
                    flight
                }
            }
        };

        // Completion, cancellation and panics all land the state back on Idle.
        let _reset = ResetOnDrop {
            owner: self,
            flight: flight.clone(),
        };
        flight.await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ResetOnDrop<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    owner: &'a SingleFlight<T>,
    flight: Flight<T>,
}

impl<T> Drop for ResetOnDrop<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut state = self.owner.lock();
        if let State::InFlight(current) = &*state {
            if current.ptr_eq(&self.flight) {
                *state = State::Idle;
            }
        }
    }
}
