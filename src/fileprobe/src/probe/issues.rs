/// Append-only list of human-readable notices attached to a parse.
///
/// Analyzers never abort on an issue unless a structural invariant is
/// violated; the log is returned alongside the parse tree. Messages bound to
/// a file position embed the absolute offset as `0x{:08x}`.
#[derive(Debug, Default)]
pub struct IssueLog {
    entries: Vec<String>,
    cap: Option<usize>,
    truncated: bool,
}

impl IssueLog {
    pub fn new() -> IssueLog {
        IssueLog::default()
    }

    /// A capped log drops further entries after `cap` and records a single
    /// truncation marker. The PCAP analyzer caps at 200; every other
    /// analyzer is uncapped.
    pub fn with_cap(cap: usize) -> IssueLog {
        IssueLog { entries: Vec::new(), cap: Some(cap), truncated: false }
    }

    pub fn note(&mut self, message: impl Into<String>) {
        if let Some(cap) = self.cap {
            if self.entries.len() >= cap {
                if !self.truncated {
                    self.truncated = true;
                    self.entries.push(format!("issue log truncated at {} entries", cap));
                }
                return;
            }
        }
        self.entries.push(message.into());
    }

    pub fn snapshot(&self) -> &[String] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_appends_one_marker() {
        let mut log = IssueLog::with_cap(2);
        log.note("a");
        log.note("b");
        log.note("c");
        log.note("d");
        assert_eq!(
            log.snapshot(),
            &["a", "b", "issue log truncated at 2 entries"]
        );
    }
}
