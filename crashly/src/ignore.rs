//! The curated set of runtime/OS-internal frames that carry no triage
//! signal. Membership is configuration data, not logic: the built-in table
//! below can be replaced wholesale with `--ignore-file`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crashly_symbols::reduce_for_signature;

use crate::error::CliError;

/// Frames matched on their signature-reduced form.
const DEFAULT_IGNORED_FRAMES: &[&str] = &[
    "posix_signal_handler",
    "_sigtramp",
    "_init",
    "_L_unlock_13",
    "0x0",
    "posix_print_stacktrace",
    "print_backtrace",
    "OL_OnTerminate",
    "void terminate",
    "_Call_func",
    "_callthreadstartex",
    "_threadstartex",
    "kernel32.dll",
    "ntdll.dll",
    "__vsnprintf_l",
    "__vsnprintf",
    // around _free
    "LdrGetProcedureAddressForCaller",
    "_WER_HEAP_MAIN_HEADER * __ptr64 WerpGetHeapHandle",
    // always together with mtx_do_lock or sleep (msvc120)
    "__Mtx_lock",
    "bool Concurrency::critical_section::_Acquire_lock",
    "void Concurrency::critical_section::lock",
    "void Concurrency::details::LockQueueNode::UpdateQueuePosition",
    "void Concurrency::details::_Timer::_Start",
    "void Concurrency::details::ReferenceLoadLibrary",
    "_TP_TIMER * Concurrency::details::RegisterAsyncTimerAndLoadLibrary",
    "virtual void Concurrency::details::ExternalContextBase::Block",
    "RtlAcquireSRWLockExclusive",
    "RtlInsertElementGenericTableFullAvl",
    "LdrLogNewDataDllLoad",
    "EtwpCreateFile",
    "BaseCheckVDMp$fin$0",
    "LdrResGetRCConfig",
    // linux, around the terminate handler
    "std::locale::locale@@GLIBCXX_3.4",
    "std::moneypunct<>::moneypunct@@GLIBCXX_3.4",
    "posix_spawnattr_setschedparam@@GLIBC_2.2.5",
    // around error handling in msvc140
    "??_C@_0CA@IFNNBHIE@FwGetRpcCallersProcessImageName?$AA@",
    "___scrt_fastfail",
    "__Mtx_clear_owner",
    "AslpFileQueryExportName$filt$0",
    "RtlpHpLfhOwnerMoveSubsegment",
    "int Concurrency::details::_Schedule_chore",
    "BasepCreateTokenFromLowboxToken",
    "long WerpAddGatherToPEB",
    "LdrpReportError",
    "RtlpReAllocateHeap",
    "RtlpHpLargeAlloc",
    "EtwpWriteToPrivateBuffers",
    // noise at the bottom of the stack
    "RtlGuardCheckImageBase",
    "LdrpResGetMappingSize",
    "RtlCompressBufferXpressHuffStandard",
    "EtwpLogger",
    "std::_LaunchPad<>::_Go",
    "RtlpGetStackTraceAddressEx",
    "WinMain",
    "vDbgPrintExWithPrefixInternal",
    "RtlIpv6AddressToStringA",
    "A_SHAUpdate",
    "CompatCacheLookupExe",
];

pub struct IgnoreSet {
    names: HashSet<String>,
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self {
            names: DEFAULT_IGNORED_FRAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl IgnoreSet {
    /// One frame name per line; blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let text =
            fs::read_to_string(path).map_err(|e| CliError::IgnoreFile(path.to_path_buf(), e))?;
        let names = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(Self { names })
    }

    /// `reduced` must already be in signature-reduced form.
    pub fn contains_reduced(&self, reduced: &str) -> bool {
        self.names.contains(reduced)
    }

    pub fn is_ignored(&self, function: &str) -> bool {
        self.contains_reduced(&reduce_for_signature(function))
    }
}
