use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::Disassembler;

/// Caller-supplied cancellation signal, checked at the documented yield
/// points of the long analyzer walks. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Coarse stages reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dispatch,
    Headers,
    Directory,
    Records,
    Resources,
    Symbols,
}

pub type ProgressFn<'a> = dyn Fn(Stage, u64, u64) + Sync + 'a;

/// Per-probe configuration. `Default` is no cancellation, no progress, no
/// disassembler, yield checks every 256 records.
pub struct ProbeOptions<'a> {
    pub cancel: Option<CancelToken>,
    pub progress: Option<&'a ProgressFn<'a>>,
    pub disassembler: Option<&'a dyn Disassembler>,
    pub yield_interval: u32,
}

impl Default for ProbeOptions<'_> {
    fn default() -> Self {
        ProbeOptions {
            cancel: None,
            progress: None,
            disassembler: None,
            yield_interval: 256,
        }
    }
}

impl ProbeOptions<'_> {
    pub fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
    }

    pub fn report(&self, stage: Stage, bytes_processed: u64, items_decoded: u64) {
        if let Some(progress) = self.progress {
            progress(stage, bytes_processed, items_decoded);
        }
    }
}
