//! The per-log crash extraction state machine.
//!
//! One forward pass over the log text, no backward transitions:
//! `SeekingHeader -> SeekingCrashMarker -> ReadingCrashBody ->
//! DumpingStack -> Terminal`. Crash logs are an informal text protocol
//! written by a crash handler that was itself crashing, so every pattern
//! here is best-effort: unparsable lines are passed over, and a truncated
//! log yields whatever was collected up to the truncation point.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use crashly_symbols::{
    format_address, reduce_for_signature, BuildDate, ModuleInfo, ModuleMap, Resolver,
};
use flate2::read::MultiGzDecoder;
use log::info;
use regex::Regex;

use crate::error::CliError;
use crate::ignore::IgnoreSet;
use crate::observe::LineObserver;

pub const UNKNOWN_FUNC: &str = "<unknown func>";

const CRASH_MARKERS: [&str; 6] = [
    "Unhandled Top Level Exception",
    "Caught SIG",
    "Dumping stack for thread",
    "Terminate Handler",
    "Dumping loaded shared objects",
    "Watchdog Thread detected hang!",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Rewrite and print the whole crash region, resolving every address.
    Full,
    /// Collect only the data needed for a triage signature, print nothing.
    Triage,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub mode: Mode,
    /// Builds strictly older than this are excluded.
    pub min_version: Option<BuildDate>,
    /// Stem of the main application binary; modules matching it (or ending
    /// in `.exe`) carry the report version.
    pub app_hint: Option<String>,
    /// Signature collection stops once this many distinct frames are
    /// gathered and one of them is an application frame.
    pub triage_depth: usize,
    /// Full mode prints at most this many frames per thread dump.
    pub max_stack_dump: usize,
    /// Memory utilization above this percentage flags an out-of-memory
    /// cause.
    pub oom_threshold_percent: f64,
    /// Full mode: echo every line instead of only the crash region.
    pub echo_all: bool,
    /// Full mode: lines of context replayed before the crash marker.
    pub context_lines: usize,
}

impl ExtractOptions {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            min_version: None,
            app_hint: None,
            triage_depth: 4,
            max_stack_dump: 30,
            oom_threshold_percent: 95.0,
            echo_all: false,
            context_lines: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeReason {
    NoHeader,
    FilteredBuild,
    NoCrash,
}

impl fmt::Display for ExcludeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExcludeReason::NoHeader => write!(f, "no build header found"),
            ExcludeReason::FilteredBuild => write!(f, "excluded by version/configuration filter"),
            ExcludeReason::NoCrash => write!(f, "no crash found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashCause {
    OutOfMemory,
    WatchdogHang,
    Terminate(String),
}

impl CrashCause {
    /// The frame standing in for the whole stack when the cause, not the
    /// stack, identifies the failure.
    pub fn signature_frame(&self) -> String {
        match self {
            CrashCause::OutOfMemory => "out of memory".to_string(),
            CrashCause::WatchdogHang => "Watchdog Thread detected hang!".to_string(),
            CrashCause::Terminate(reason) => format!("TERMINATE: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub raw_address: u64,
    pub function: Option<String>,
    pub line: Option<u32>,
    pub file: Option<String>,
}

#[derive(Debug)]
pub struct CrashReport {
    pub path: String,
    pub version: String,
    pub platform: String,
    pub build_config: String,
    pub build_date: BuildDate,
    pub modules: ModuleMap,
    pub frames: Vec<StackFrame>,
    /// True iff at least one resolved frame came from the versioned
    /// application module; a stack without one is pure system noise.
    pub has_application_frame: bool,
    pub cause: Option<CrashCause>,
    /// Signature-reduced, ignore-filtered, consecutive-dedup'd frame names.
    pub signature: Vec<String>,
}

#[derive(Debug)]
pub enum ExtractOutcome {
    Excluded(ExcludeReason),
    Report(CrashReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekingHeader,
    SeekingCrashMarker,
    ReadingCrashBody,
    DumpingStack,
    Terminal,
}

struct LinePatterns {
    build_header: Regex,
    module_base: Regex,
    called_from: Regex,
    mac_frame: Regex,
    module_ref: Regex,
    memory_load: Regex,
    virtual_memory: Regex,
    terminate: Regex,
    hex_address: Regex,
}

impl LinePatterns {
    fn new() -> Self {
        Self {
            build_header: Regex::new(
                r"^Build Version: ([A-Za-z]+).*(Release|Debug|Develop|Builder|Steam)(32|64) ([^,]*),",
            )
            .unwrap(),
            module_base: Regex::new(
                r"'([^']+)' base address is 0x([a-fA-F0-9]+), size is 0x([a-fA-F0-9]+)",
            )
            .unwrap(),
            called_from: Regex::new(r"[cC]alled from 0x([a-fA-F0-9]+)").unwrap(),
            mac_frame: Regex::new(r"0x[a-fA-F0-9]+ (.+) \+ [0-9]+ \(([^)]+)\)").unwrap(),
            module_ref: Regex::new(r"^In module: '([^']*)'").unwrap(),
            memory_load: Regex::new(r"Memory is ([0-9]+)% in use\.").unwrap(),
            virtual_memory: Regex::new(r"([0-9. ]+)/([0-9. ]+) MB virtual memory free").unwrap(),
            terminate: Regex::new(r"ASSERT\(Terminate Handler\): Exception: (.*)$").unwrap(),
            hex_address: Regex::new(r"0x([a-fA-F0-9]{6,})").unwrap(),
        }
    }
}

pub struct Extractor<'a> {
    resolver: Resolver<'a>,
    ignore: &'a IgnoreSet,
    options: ExtractOptions,
    patterns: LinePatterns,
}

impl<'a> Extractor<'a> {
    pub fn new(resolver: Resolver<'a>, ignore: &'a IgnoreSet, options: ExtractOptions) -> Self {
        Self {
            resolver,
            ignore,
            options,
            patterns: LinePatterns::new(),
        }
    }

    pub fn resolver(&self) -> &Resolver<'a> {
        &self.resolver
    }

    pub fn extract_file(
        &self,
        path: &Path,
        observers: &mut [Box<dyn LineObserver>],
        out: &mut dyn Write,
    ) -> Result<ExtractOutcome, CliError> {
        let file = File::open(path).map_err(|e| CliError::OpenLog(path.to_path_buf(), e))?;
        let reader: Box<dyn BufRead> = if path.extension().is_some_and(|ext| ext == "gz") {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let label = path.display().to_string();
        Ok(self.extract(&label, reader, observers, out)?)
    }

    /// Runs the state machine over one log. Read errors (including invalid
    /// UTF-8 and truncated gzip streams) end the input; whatever was
    /// collected so far still produces a report.
    pub fn extract(
        &self,
        path: &str,
        reader: impl BufRead,
        observers: &mut [Box<dyn LineObserver>],
        out: &mut dyn Write,
    ) -> io::Result<ExtractOutcome> {
        let full = self.options.mode == Mode::Full;

        let mut state = State::SeekingHeader;
        let mut platform = String::new();
        let mut build_config = String::new();
        let mut build_date: Option<BuildDate> = None;
        let mut version = String::new();
        let mut echo_header_follow = false;

        let mut recent: VecDeque<String> = VecDeque::new();
        let mut modules = ModuleMap::new();
        let mut frames: Vec<StackFrame> = Vec::new();
        let mut signature: Vec<String> = Vec::new();
        let mut signature_done = false;
        let mut has_app_frame = false;
        let mut cause: Option<CrashCause> = None;
        let mut pending_hex: Vec<(String, u64, String)> = Vec::new();
        let mut printed_frames = 0usize;
        let mut skipped_frames = 0usize;
        let mut awaiting_module_ref = false;

        for next in reader.lines() {
            let Ok(line) = next else { break };
            let line = line.as_str();

            match state {
                State::SeekingHeader => {
                    let Some(caps) = self.patterns.build_header.captures(line) else {
                        continue;
                    };
                    let Some(date) = BuildDate::parse_header(caps[4].trim()) else {
                        continue;
                    };
                    platform = caps[1].to_string();
                    build_config = format!("{}{}", &caps[2], &caps[3]);
                    build_date = Some(date);
                    version = date.version_string();
                    if build_config.starts_with("Debug") || build_config.starts_with("Develop") {
                        return Ok(ExtractOutcome::Excluded(ExcludeReason::FilteredBuild));
                    }
                    if let Some(min) = self.options.min_version {
                        if date < min {
                            return Ok(ExtractOutcome::Excluded(ExcludeReason::FilteredBuild));
                        }
                    }
                    if full {
                        info!("build version: {version}");
                        writeln!(out, "{line}")?;
                        // The line after the header is the platform blurb.
                        echo_header_follow = true;
                    }
                    state = State::SeekingCrashMarker;
                }

                State::SeekingCrashMarker => {
                    if echo_header_follow {
                        echo_header_follow = false;
                        writeln!(out, "{line}")?;
                        continue;
                    }
                    for observer in observers.iter_mut() {
                        observer.observe_line(line);
                    }
                    if full {
                        if self.options.echo_all {
                            writeln!(out, "{line}")?;
                        } else {
                            recent.push_back(line.to_string());
                            while recent.len() > self.options.context_lines {
                                recent.pop_front();
                            }
                        }
                    }
                    if let Some(caps) = self.patterns.terminate.captures(line) {
                        let reason = CrashCause::Terminate(caps[1].trim().to_string());
                        signature = vec![reason.signature_frame()];
                        cause = Some(reason);
                    }
                    if line.contains("Watchdog Thread detected hang!") {
                        cause = Some(CrashCause::WatchdogHang);
                    }
                    if CRASH_MARKERS.iter().any(|marker| line.contains(marker)) {
                        if full {
                            info!("found crash: {line}");
                            for observer in observers.iter_mut() {
                                observer.finish(out)?;
                            }
                            for context_line in recent.drain(..) {
                                writeln!(out, "{context_line}")?;
                            }
                        }
                        state = State::ReadingCrashBody;
                    }
                }

                State::ReadingCrashBody | State::DumpingStack => {
                    // Once the signature's tail is a placeholder, the only
                    // remaining interest is an `In module:` attribution.
                    if awaiting_module_ref {
                        if let Some(caps) = self.patterns.module_ref.captures(line) {
                            if let Some(last) = signature.last_mut() {
                                *last = caps[1].to_string();
                            }
                            state = State::Terminal;
                            break;
                        }
                        continue;
                    }

                    if let Some(percent) = self.memory_utilization(line) {
                        if percent > self.options.oom_threshold_percent {
                            cause = Some(CrashCause::OutOfMemory);
                            if !full {
                                state = State::Terminal;
                                break;
                            }
                            info!("out of memory ({percent:.0}% in use)");
                        }
                    }

                    if let Some(caps) = self.patterns.module_base.captures(line) {
                        let (Ok(base), Ok(size)) = (
                            u64::from_str_radix(&caps[2], 16),
                            u64::from_str_radix(&caps[3], 16),
                        ) else {
                            continue;
                        };
                        let name = caps[1].to_string();
                        let is_app = name.ends_with(".exe")
                            || self
                                .options
                                .app_hint
                                .as_deref()
                                .is_some_and(|hint| name.contains(hint));
                        modules.push(ModuleInfo {
                            name,
                            base,
                            size,
                            version: is_app.then(|| version.clone()),
                        });
                        continue;
                    }

                    if full && !modules.is_empty() && !pending_hex.is_empty() {
                        for (prefix, address, suffix) in pending_hex.drain(..) {
                            let symbol = self.resolver.lookup(&modules, address);
                            if !symbol.is_unknown() {
                                let formatted = format_address(address, &symbol);
                                writeln!(out, "{prefix}{formatted}{suffix}")?;
                            }
                        }
                    }

                    if line.contains("Dumping stack") {
                        if full && skipped_frames > 0 {
                            writeln!(out, "...skipped {skipped_frames} stack frames")?;
                        }
                        printed_frames = 0;
                        skipped_frames = 0;
                        if state == State::DumpingStack && !full && !signature.is_empty() {
                            // Next thread; the first dump is the one that
                            // crashed.
                            if signature.last().map(String::as_str) == Some(UNKNOWN_FUNC) {
                                awaiting_module_ref = true;
                                continue;
                            }
                            state = State::Terminal;
                            break;
                        }
                        state = State::DumpingStack;
                        if full {
                            writeln!(out)?;
                        }
                    }

                    if let Some(caps) = self.patterns.called_from.captures(line) {
                        if let Ok(address) = u64::from_str_radix(&caps[1], 16) {
                            state = State::DumpingStack;
                            let span = caps.get(0).unwrap();
                            let (display_line, function, frame_has_app) = self.collect_frame(
                                line,
                                span.range(),
                                address,
                                &modules,
                                &mut frames,
                            );
                            if frame_has_app {
                                has_app_frame = true;
                            }
                            if !signature_done {
                                let reduced = signature_name(function.as_deref());
                                if !self.ignore.contains_reduced(&reduced)
                                    && signature.last().map(String::as_str)
                                        != Some(reduced.as_str())
                                {
                                    signature.push(reduced);
                                    if signature.len() >= self.options.triage_depth
                                        && has_app_frame
                                    {
                                        signature_done = true;
                                        if !full {
                                            state = State::Terminal;
                                            break;
                                        }
                                    }
                                }
                            }
                            if full {
                                printed_frames += 1;
                                if printed_frames <= self.options.max_stack_dump {
                                    writeln!(out, "{display_line}")?;
                                } else {
                                    skipped_frames += 1;
                                }
                            }
                            continue;
                        }
                    }

                    if full {
                        self.emit_plain_line(line, &modules, &mut pending_hex, out)?;
                    }
                }

                State::Terminal => break,
            }
        }

        match state {
            State::SeekingHeader => return Ok(ExtractOutcome::Excluded(ExcludeReason::NoHeader)),
            State::SeekingCrashMarker => {
                return Ok(ExtractOutcome::Excluded(ExcludeReason::NoCrash))
            }
            _ => {}
        }

        if full && skipped_frames > 0 {
            writeln!(out, "...skipped {skipped_frames} stack frames")?;
        }
        if matches!(
            cause,
            Some(CrashCause::OutOfMemory) | Some(CrashCause::WatchdogHang)
        ) {
            signature = vec![cause.as_ref().unwrap().signature_frame()];
        }

        Ok(ExtractOutcome::Report(CrashReport {
            path: path.to_string(),
            version,
            platform,
            build_config,
            // Unreachable fallback: the header state guarantees a date.
            build_date: build_date.unwrap_or_else(|| BuildDate::new(1970, 1, 1).unwrap()),
            modules,
            frames,
            has_application_frame: has_app_frame,
            cause,
            signature,
        }))
    }

    /// Resolves one `called from` frame. Returns the rewritten display
    /// line, the display function name, and whether the frame came from the
    /// versioned application module.
    fn collect_frame(
        &self,
        line: &str,
        span: std::ops::Range<usize>,
        address: u64,
        modules: &ModuleMap,
        frames: &mut Vec<StackFrame>,
    ) -> (String, Option<String>, bool) {
        if let Some(mac) = self.patterns.mac_frame.captures(line) {
            // Pre-symbolicated frame (mac crash handler output).
            let function = mac[1].to_string();
            let module = mac[2].to_string();
            let frame_has_app = self
                .options
                .app_hint
                .as_deref()
                .is_some_and(|hint| module.contains(hint));
            frames.push(StackFrame {
                raw_address: address,
                function: Some(function.clone()),
                line: None,
                file: Some(module),
            });
            let display_line = line
                .replace("[POSIX] ", "")
                .replace("called from", "from")
                .replace("Called from", "from");
            return (display_line, Some(function), frame_has_app);
        }

        let symbol = self.resolver.lookup(modules, address);
        let frame_has_app = !symbol.is_unknown()
            && modules
                .find(address)
                .is_some_and(|module| module.version.is_some());
        let formatted = format_address(address, &symbol);
        let display_line = format!(
            "{}{}{}",
            &line[..span.start],
            formatted,
            &line[span.end..]
        )
        .replace("[win32] ", "");
        frames.push(StackFrame {
            raw_address: address,
            function: symbol.function.clone(),
            line: symbol.line,
            file: symbol.file.clone(),
        });
        (display_line, symbol.function, frame_has_app)
    }

    /// Full-mode handling for lines that are not frames: any long hex
    /// constant gets resolved in place, or buffered until the module table
    /// exists.
    fn emit_plain_line(
        &self,
        line: &str,
        modules: &ModuleMap,
        pending_hex: &mut Vec<(String, u64, String)>,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        if !line.contains("thread 0x") {
            if let Some(caps) = self.patterns.hex_address.captures(line) {
                if let Ok(address) = u64::from_str_radix(&caps[1], 16) {
                    let span = caps.get(0).unwrap().range();
                    if modules.is_empty() {
                        pending_hex.push((
                            line[..span.start].to_string(),
                            address,
                            line[span.end..].to_string(),
                        ));
                        return Ok(());
                    }
                    let symbol = self.resolver.lookup(modules, address);
                    let formatted = format_address(address, &symbol);
                    writeln!(
                        out,
                        "{}{}{}",
                        &line[..span.start],
                        formatted,
                        &line[span.end..]
                    )?;
                    return Ok(());
                }
            }
        }
        writeln!(out, "{line}")
    }

    fn memory_utilization(&self, line: &str) -> Option<f64> {
        if let Some(caps) = self.patterns.memory_load.captures(line) {
            return caps[1].parse::<f64>().ok();
        }
        let caps = self.patterns.virtual_memory.captures(line)?;
        let free: f64 = caps[1].trim().parse().ok()?;
        let total: f64 = caps[2].trim().parse().ok()?;
        if total <= 0.0 {
            return None;
        }
        Some(100.0 * (1.0 - free / total))
    }
}

fn signature_name(function: Option<&str>) -> String {
    match function {
        Some(function) => {
            let function = if function.ends_with(".DLL") {
                function.to_lowercase()
            } else {
                function.to_string()
            };
            reduce_for_signature(&function)
        }
        None => UNKNOWN_FUNC.to_string(),
    }
}
