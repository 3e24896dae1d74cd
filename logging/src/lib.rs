use core::sync::atomic::{AtomicU64, Ordering};

use derive_more::Display;

pub static PROGRESS_LOG_METRICS: ProgressLogMetrics = ProgressLogMetrics::new(0);

#[derive(Display, Debug)]
#[display("epochs: {processed_epoch_count:?}/{target_epoch_count:?}")]
pub struct ProgressLogMetrics {
    processed_epoch_count: AtomicU64,
    target_epoch_count: AtomicU64,
}

impl ProgressLogMetrics {
    #[must_use]
    pub const fn new(target_epoch_count: u64) -> Self {
        Self {
            processed_epoch_count: AtomicU64::new(0),
            target_epoch_count: AtomicU64::new(target_epoch_count),
        }
    }

    pub fn reset(&self, target_epoch_count: u64) {
        self.processed_epoch_count.store(0, Ordering::Relaxed);
        self.target_epoch_count
            .store(target_epoch_count, Ordering::Relaxed);
    }

    pub fn increment_processed_epoch_count(&self) {
        self.processed_epoch_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn processed_epoch_count(&self) -> u64 {
        self.processed_epoch_count.load(Ordering::Relaxed)
    }
}

#[macro_export]
macro_rules! info_with_progress {
    ($($arg:tt)*) => {
        ::log::info!("[{}] {}", $crate::PROGRESS_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! debug_with_progress {
    ($($arg:tt)*) => {
        ::log::debug!("[{}] {}", $crate::PROGRESS_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn_with_progress {
    ($($arg:tt)*) => {
        ::log::warn!("[{}] {}", $crate::PROGRESS_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! error_with_progress {
    ($($arg:tt)*) => {
        ::log::error!("[{}] {}", $crate::PROGRESS_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_with_progress {
    ($($arg:tt)*) => {
        ::log::trace!("[{}] {}", $crate::PROGRESS_LOG_METRICS, format_args!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_displayed_as_a_fraction() {
        let metrics = ProgressLogMetrics::new(0);

        metrics.reset(12);
        metrics.increment_processed_epoch_count();
        metrics.increment_processed_epoch_count();

        assert_eq!(metrics.to_string(), "epochs: 2/12");
        assert_eq!(metrics.processed_epoch_count(), 2);
    }
}
