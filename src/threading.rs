//! OS thread priority helper used by the default thread factory.

/// Apply normal (non-realtime) scheduling priority to the calling thread.
///
/// Pool threads should compete like ordinary application threads, so the
/// default factory resets any inherited scheduling class.
///
/// # Platform Support
/// - **Linux**: `pthread_setschedparam` with `SCHED_OTHER`, priority 0
/// - **Other platforms**: no-op
pub(crate) fn set_normal_thread_priority() {
    #[cfg(target_os = "linux")]
    {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_OTHER};
        use std::mem;

        unsafe {
            let mut param: sched_param = mem::zeroed();
            param.sched_priority = 0;
            let thread = pthread_self();
            // Silently ignored on failure; priority is best-effort.
            let _ = pthread_setschedparam(thread, SCHED_OTHER, &param);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_priority_is_best_effort() {
        set_normal_thread_priority();
    }
}
