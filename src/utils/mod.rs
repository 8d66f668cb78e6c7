pub mod async_task;
pub mod time;

#[cfg(test)]
mod time_test;

/// Correlation id attached to extension invocations.
pub fn new_trace_id() -> String {
    nanoid::nanoid!()
}
