//! Terminal output for the aggregated event stream

use anyhow::{Context, Result};
use std::io::Write;

use cadre_cluster::{ClusterEvent, ReporterEvent, RunSummary};

/// Totals gathered from the event stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl Tally {
    fn record(&mut self, event: &ReporterEvent) {
        match event {
            ReporterEvent::Pass { .. } => self.passed += 1,
            ReporterEvent::Fail { .. } => self.failed += 1,
            ReporterEvent::Pending { .. } => self.pending += 1,
            _ => {}
        }
    }
}

/// Consumes cluster events and renders them
pub trait Reporter: Send {
    fn on_event(&mut self, event: &ClusterEvent) -> Result<()>;

    /// Print closing output once the run has returned
    fn finish(&mut self, summary: Option<&RunSummary>) -> Result<()>;

    fn tally(&self) -> &Tally;
}

/// Lists failures and prints totals at the end
pub struct SummaryReporter<W> {
    out: W,
    tally: Tally,
    failures: Vec<(String, String, Option<String>)>,
}

impl<W: Write + Send> SummaryReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            tally: Tally::default(),
            failures: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Reporter for SummaryReporter<W> {
    fn on_event(&mut self, event: &ClusterEvent) -> Result<()> {
        self.tally.record(&event.event);
        if let ReporterEvent::Fail { test, error } = &event.event {
            self.failures.push((
                test.full_title().to_string(),
                error.message.clone(),
                error.stack.clone(),
            ));
        }
        Ok(())
    }

    fn finish(&mut self, summary: Option<&RunSummary>) -> Result<()> {
        let out = &mut self.out;
        writeln!(out)?;
        writeln!(out, "  {} passing", self.tally.passed)?;
        if self.tally.failed > 0 {
            writeln!(out, "  {} failing", self.tally.failed)?;
        }
        if self.tally.pending > 0 {
            writeln!(out, "  {} pending", self.tally.pending)?;
        }

        for (index, (title, message, stack)) in self.failures.iter().enumerate() {
            writeln!(out)?;
            writeln!(out, "  {}) {}", index + 1, title)?;
            writeln!(out, "     {}", message)?;
            if let Some(stack) = stack {
                for line in stack.lines() {
                    writeln!(out, "       {}", line)?;
                }
            }
        }

        if let Some(summary) = summary {
            if summary.requeued > 0 {
                writeln!(out)?;
                writeln!(out, "  {} file(s) retried after a worker crash", summary.requeued)?;
            }
        }
        out.flush().context("Failed to flush output")
    }

    fn tally(&self) -> &Tally {
        &self.tally
    }
}

/// Writes one JSON object per event
pub struct JsonReporter<W> {
    out: W,
    tally: Tally,
}

impl<W: Write + Send> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            tally: Tally::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Reporter for JsonReporter<W> {
    fn on_event(&mut self, event: &ClusterEvent) -> Result<()> {
        self.tally.record(&event.event);
        let line = serde_json::to_string(event).context("Failed to serialize event")?;
        writeln!(self.out, "{}", line)?;
        Ok(())
    }

    fn finish(&mut self, _summary: Option<&RunSummary>) -> Result<()> {
        self.out.flush().context("Failed to flush output")
    }

    fn tally(&self) -> &Tally {
        &self.tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_cluster::{ErrorRecord, SerializedTest, WorkerId};

    fn pass(title: &str) -> ClusterEvent {
        ClusterEvent::from_worker(
            WorkerId::new(1),
            ReporterEvent::Pass {
                test: SerializedTest::new(title, format!("suite {}", title)).into(),
            },
        )
    }

    fn fail(title: &str, message: &str) -> ClusterEvent {
        ClusterEvent::from_worker(
            WorkerId::new(2),
            ReporterEvent::Fail {
                test: SerializedTest::new(title, format!("suite {}", title)).into(),
                error: ErrorRecord::new(message).with_stack("at line 3"),
            },
        )
    }

    #[test]
    fn test_summary_output() {
        let mut reporter = SummaryReporter::new(Vec::new());
        for event in [ClusterEvent::start(), pass("a"), fail("b", "boom"), ClusterEvent::end()] {
            reporter.on_event(&event).unwrap();
        }
        reporter.finish(Some(&RunSummary::default())).unwrap();
        assert_eq!(
            reporter.tally(),
            &Tally {
                passed: 1,
                failed: 1,
                pending: 0
            }
        );

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(text.contains("1 passing"));
        assert!(text.contains("1 failing"));
        assert!(text.contains("1) suite b"));
        assert!(text.contains("boom"));
        assert!(text.contains("at line 3"));
        assert!(!text.contains("pending"));
    }

    #[test]
    fn test_json_output_is_one_line_per_event() {
        let mut reporter = JsonReporter::new(Vec::new());
        for event in [ClusterEvent::start(), pass("a"), ClusterEvent::end()] {
            reporter.on_event(&event).unwrap();
        }
        reporter.finish(None).unwrap();

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "start");
        assert_eq!(lines[1]["event"], "pass");
        assert_eq!(lines[1]["test"]["title"], "a");
        assert_eq!(lines[2]["event"], "end");
    }
}
