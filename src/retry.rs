//! Bounded retry.

/// What one attempt of a retried operation concluded.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T, E> {
    Done(T),
    /// Not there yet; try again if the budget allows.
    Again,
    /// Stop immediately.
    Fail(E),
}

/// Why [`bounded`] gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exhausted<E> {
    /// Every attempt in the budget answered [`Attempt::Again`].
    Budget,
    Failed(E),
}

/// Run `op` up to `budget` times, passing the zero-based attempt number.
pub fn bounded<T, E>(
    budget: u32,
    mut op: impl FnMut(u32) -> Attempt<T, E>,
) -> Result<T, Exhausted<E>> {
    for attempt in 0..budget {
        match op(attempt) {
            Attempt::Done(value) => return Ok(value),
            Attempt::Again => {}
            Attempt::Fail(e) => return Err(Exhausted::Failed(e)),
        }
    }
    Err(Exhausted::Budget)
}
