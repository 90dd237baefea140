use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all possible error conditions that can occur while opening a binary and its
/// debug database, parsing PE-specific metadata, and answering byte-attribution queries. Each
/// variant provides specific context about the failure mode to enable appropriate error handling.
///
/// # Error Categories
///
/// ## File Parsing Errors
/// - [`Error::Malformed`] - Corrupted or invalid file structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond file boundaries
/// - [`Error::Empty`] - Empty input provided
///
/// ## I/O and External Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - PE parsing errors from the goblin crate
///
/// ## Unsupported-Input Errors (detected at session-open time)
/// - [`Error::ManagedBinary`] - The image is a managed (.NET) binary
/// - [`Error::DebugInfoMismatch`] - Binary and debug database signatures disagree
/// - [`Error::MinimalDebugInfo`] - The debug database was stripped of the detail required
/// - [`Error::UnsupportedMachine`] - The image targets a machine this library cannot decode
///
/// ## Attribution Consistency Errors
/// - [`Error::AttributionGap`] - Bytes in a geometry unit no symbol accounts for
/// - [`Error::AttributionConflict`] - Two non-zero-sized symbols claiming the same bytes
/// - [`Error::Sealed`] / [`Error::NotSealed`] - Contribution lifecycle misuse
///
/// ## Cooperative Cancellation
/// - [`Error::Cancelled`] - An in-flight enumeration was cancelled by the caller
///
/// # Examples
///
/// ```rust,ignore
/// use sizescope::{CancellationToken, Error, Session, SessionOptions};
///
/// let token = CancellationToken::new();
/// match Session::open_file("app.dll".as_ref(), provider, SessionOptions::default(), &token) {
///     Ok(session) => {
///         println!("Opened {} sections", session.binary_sections().len());
///     }
///     Err(Error::ManagedBinary) => {
///         eprintln!("Managed assemblies are not supported, only native code");
///     }
///     Err(Error::DebugInfoMismatch { message }) => {
///         eprintln!("Wrong debug database: {message}");
///     }
///     Err(e) => {
///         eprintln!("Other error: {e}");
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// This error indicates that the file structure is corrupted or doesn't conform to the
    /// expected PE format - including compiler- or linker-emitted records (unwind data,
    /// exception metadata, resource directories) that decode to impossible values. The error
    /// includes the source location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    ///
    /// This error occurs when trying to read data beyond the end of the image.
    /// It's a safety check to prevent buffer overruns during parsing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur during file operations
    /// such as reading from disk, permission issues, or filesystem errors.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories or for
    /// wrapping external library errors with additional context.
    #[error("{0}")]
    Error(String),

    /// Error from the goblin crate during PE parsing.
    ///
    /// The goblin crate is used for low-level PE format parsing.
    /// This error wraps any failures from that parsing layer.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// The image is a managed (.NET) binary.
    ///
    /// Byte attribution needs native symbols, section contributions and unwind metadata;
    /// managed images carry none of these in a usable form. Detected at session-open time
    /// from the presence of a CLR runtime header.
    #[error("This is a managed (.NET) binary - only native PE images can be analyzed")]
    ManagedBinary,

    /// The binary and the debug database do not belong together.
    ///
    /// The RSDS debug signature embedded in the image (GUID + age) must match the signature
    /// reported by the debug-symbol provider. A mismatch usually means the wrong database
    /// was supplied - or the binary and database arguments were swapped, which surfaces as
    /// the same signature-format mismatch.
    #[error("Binary and debug database do not match - {message}")]
    DebugInfoMismatch {
        /// Names both signatures so callers can present an actionable message.
        message: String,
    },

    /// The debug database lacks the symbol detail required for analysis.
    ///
    /// "Minimal" or publics-stripped databases can resolve addresses but cannot answer the
    /// compiland, section-contribution and source-file queries this engine is built on.
    #[error(
        "The debug database is minimal/stripped and lacks the detail required for size analysis"
    )]
    MinimalDebugInfo,

    /// The image targets a machine type this library cannot decode.
    ///
    /// Exception metadata is architecture-specific; only x64, I386, ARM and ARM64
    /// decoding rules are implemented. The associated value is the raw COFF machine field.
    #[error("Unsupported machine type 0x{0:04X}")]
    UnsupportedMachine(u16),

    /// A geometry unit contains bytes no symbol accounts for.
    ///
    /// For any enumerated section, COFF group or contribution, the summed virtual size of the
    /// attributed symbols plus inferred inter-symbol padding must equal the unit's virtual
    /// size within the configured tolerance. A larger gap means the analysis lost track of
    /// bytes, and a wrong answer is worse than a loud failure in a size-accounting tool.
    #[error("{unit}: {gap} unattributed bytes (attributed 0x{attributed:X} of 0x{expected:X}, tolerance {tolerance})")]
    AttributionGap {
        /// Human-readable name of the geometry unit being enumerated
        unit: String,
        /// Bytes the unit spans
        expected: u64,
        /// Bytes accounted for by symbols and inferred padding
        attributed: u64,
        /// The unattributed remainder
        gap: u64,
        /// The tolerance that was exceeded
        tolerance: u32,
    },

    /// Two non-zero-sized symbols claim the same RVA.
    ///
    /// COMDAT-folded duplicates are normalized to a single canonical owner before this check,
    /// and zero-sized symbols (labels in the middle of a procedure) are allowed to coexist,
    /// so two remaining claimants mean the engine double-counted bytes.
    #[error("Two non-zero-sized symbols claim RVA 0x{rva:X}: '{first}' and '{second}'")]
    AttributionConflict {
        /// The contested address
        rva: u32,
        /// Name of the first claimant
        first: String,
        /// Name of the second claimant
        second: String,
    },

    /// A sealed object was mutated.
    ///
    /// Contributions, sections and COFF groups accept construction-time mutation only;
    /// once sealed they are immutable and further `add` calls fail with this error.
    #[error("Object has already been sealed and can no longer be mutated")]
    Sealed,

    /// A not-yet-sealed object was queried.
    ///
    /// Size and range queries are only available once construction has completed and the
    /// object has been sealed; reading earlier would observe partial state.
    #[error("Object has not been sealed yet, queries are not available")]
    NotSealed,

    /// The operation was cancelled via its [`crate::CancellationToken`].
    ///
    /// Cancellation is checked at symbol-by-symbol granularity during large enumerations
    /// and surfaces as this error, never as a partial result.
    #[error("The operation was cancelled")]
    Cancelled,
}
