//! Decode-thread scheduling priority.
//!
//! Decode workers compete with everything else on the machine while the
//! render callback's deadline is fixed, so they ask for round-robin
//! realtime scheduling where the platform permits. Failure is expected
//! without elevated privileges and is never fatal.

/// Priority step above the scheduler's minimum for the chosen policy.
#[cfg(unix)]
const DECODE_THREAD_IMPORTANCE: i32 = 6;

#[cfg(unix)]
pub(crate) fn promote_decode_thread() {
    unsafe {
        let policy = libc::SCHED_RR;
        let min = libc::sched_get_priority_min(policy);
        let max = libc::sched_get_priority_max(policy);
        if min < 0 || max < 0 {
            tracing::debug!("scheduler does not report SCHED_RR priorities");
            return;
        }

        let param = libc::sched_param {
            sched_priority: (min + DECODE_THREAD_IMPORTANCE).min(max),
        };
        let rc = libc::pthread_setschedparam(libc::pthread_self(), policy, &param);
        if rc != 0 {
            // Usual case without CAP_SYS_NICE / root; the worker still runs
            // at default priority.
            tracing::debug!(rc, "could not raise decode thread priority");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn promote_decode_thread() {}
