mod probe;
mod formats;

pub use probe::*;
pub use formats::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_rejects_nothing() {
        let source = MemorySource::new(vec![]);
        let outcome = probe(&source, &ProbeOptions::default());

        assert_eq!(outcome.format, FormatKind::Unknown);
        assert!(outcome.parsed.is_none());
    }
}
