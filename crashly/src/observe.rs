use std::io::{self, Write};

/// Per-line analytics collaborator.
///
/// Timestamp histograms, assertion counters and the like live outside this
/// tool; the extractor only promises to feed every line between the build
/// header and the crash marker through the registered observers, and to let
/// them report once the crash region starts.
pub trait LineObserver {
    fn observe_line(&mut self, line: &str);

    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let _ = out;
        Ok(())
    }
}
