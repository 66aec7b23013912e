//! CA response status codes (`ECA_*`), as carried by transport callbacks.

/// Severity class packed into the low three bits of a CA status code
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// Condition reported by the server (or the transport) for a request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    DblClFail = 18,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    EvDisallow = 26,
    BadMonId = 30,
    BadMask = 41,
    IoDone = 42,
    IoInProgress = 43,
    BadSyncGrp = 44,
    PutCbInProg = 45,
    NoRdAccess = 46,
    NoWtAccess = 47,
    Anachronism = 48,
    NoSearchAddr = 49,
    NoConvert = 50,
    BadChId = 51,
    BadFuncPtr = 52,
    IsAttached = 53,
    UnavailInServ = 54,
    ChanDestroy = 55,
    BadPriority = 56,
    NotThreaded = 57,
    Array16kClient = 58,
    ConnSeqTmo = 59,
    UnrespTmo = 60,
}

impl ErrorCondition {
    pub fn get_severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::AllocMem => ErrorSeverity::Warning,
            Self::TooLarge => ErrorSeverity::Warning,
            Self::Timeout => ErrorSeverity::Warning,
            Self::BadType => ErrorSeverity::Error,
            Self::Internal => ErrorSeverity::Severe,
            Self::DblClFail => ErrorSeverity::Warning,
            Self::GetFail => ErrorSeverity::Warning,
            Self::PutFail => ErrorSeverity::Warning,
            Self::BadCount => ErrorSeverity::Warning,
            Self::BadStr => ErrorSeverity::Error,
            Self::Disconn => ErrorSeverity::Warning,
            Self::EvDisallow => ErrorSeverity::Error,
            Self::BadMonId => ErrorSeverity::Error,
            Self::BadMask => ErrorSeverity::Error,
            Self::IoDone => ErrorSeverity::Info,
            Self::IoInProgress => ErrorSeverity::Info,
            Self::BadSyncGrp => ErrorSeverity::Error,
            Self::PutCbInProg => ErrorSeverity::Error,
            Self::NoRdAccess => ErrorSeverity::Warning,
            Self::NoWtAccess => ErrorSeverity::Warning,
            Self::Anachronism => ErrorSeverity::Error,
            Self::NoSearchAddr => ErrorSeverity::Warning,
            Self::NoConvert => ErrorSeverity::Warning,
            Self::BadChId => ErrorSeverity::Error,
            Self::BadFuncPtr => ErrorSeverity::Error,
            Self::IsAttached => ErrorSeverity::Warning,
            Self::UnavailInServ => ErrorSeverity::Warning,
            Self::ChanDestroy => ErrorSeverity::Warning,
            Self::BadPriority => ErrorSeverity::Error,
            Self::NotThreaded => ErrorSeverity::Error,
            Self::Array16kClient => ErrorSeverity::Warning,
            Self::ConnSeqTmo => ErrorSeverity::Warning,
            Self::UnrespTmo => ErrorSeverity::Warning,
        }
    }

    /// Did the request this condition answers succeed?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Normal | Self::IoDone)
    }

    /// The full status word, with the severity in the low bits
    pub fn status_code(&self) -> u32 {
        ((*self as u32) << 3) | self.get_severity() as u32
    }

    /// Recover a condition from a full status word, as the C library reports it
    pub fn from_status_code(code: u32) -> Option<Self> {
        let condition = Self::from_message_number(code >> 3)?;
        (condition.status_code() == code).then_some(condition)
    }

    fn from_message_number(number: u32) -> Option<Self> {
        Some(match number {
            0 => Self::Normal,
            6 => Self::AllocMem,
            9 => Self::TooLarge,
            10 => Self::Timeout,
            14 => Self::BadType,
            17 => Self::Internal,
            18 => Self::DblClFail,
            19 => Self::GetFail,
            20 => Self::PutFail,
            22 => Self::BadCount,
            23 => Self::BadStr,
            24 => Self::Disconn,
            26 => Self::EvDisallow,
            30 => Self::BadMonId,
            41 => Self::BadMask,
            42 => Self::IoDone,
            43 => Self::IoInProgress,
            44 => Self::BadSyncGrp,
            45 => Self::PutCbInProg,
            46 => Self::NoRdAccess,
            47 => Self::NoWtAccess,
            48 => Self::Anachronism,
            49 => Self::NoSearchAddr,
            50 => Self::NoConvert,
            51 => Self::BadChId,
            52 => Self::BadFuncPtr,
            53 => Self::IsAttached,
            54 => Self::UnavailInServ,
            55 => Self::ChanDestroy,
            56 => Self::BadPriority,
            57 => Self::NotThreaded,
            58 => Self::Array16kClient,
            59 => Self::ConnSeqTmo,
            60 => Self::UnrespTmo,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            Self::Normal => "Normal successful completion",
            Self::AllocMem => "Unable to allocate additional dynamic memory",
            Self::TooLarge => "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
            Self::Timeout => "User specified timeout on IO operation expired",
            Self::BadType => "The data type specified is invalid",
            Self::Internal => "Channel Access Internal Failure",
            Self::DblClFail => "The requested local DB operation failed",
            Self::GetFail => "Channel read request failed",
            Self::PutFail => "Channel write request failed",
            Self::BadCount => "Invalid element count requested",
            Self::BadStr => "Invalid string",
            Self::Disconn => "Virtual circuit disconnect",
            Self::EvDisallow => "Request inappropriate within subscription (monitor) update callback",
            Self::BadMonId => "Bad event subscription (monitor) identifier",
            Self::BadMask => "Invalid event selection mask",
            Self::IoDone => "IO operations have completed",
            Self::IoInProgress => "IO operations are in progress",
            Self::BadSyncGrp => "Invalid synchronous group identifier",
            Self::PutCbInProg => "Put callback timed out",
            Self::NoRdAccess => "Read access denied",
            Self::NoWtAccess => "Write access denied",
            Self::Anachronism => "Requested feature is no longer supported",
            Self::NoSearchAddr => "Empty PV search address list",
            Self::NoConvert => "No reasonable data conversion between client and server types",
            Self::BadChId => "Invalid channel identifier",
            Self::BadFuncPtr => "Invalid function pointer",
            Self::IsAttached => "Thread is already attached to a client context",
            Self::UnavailInServ => "Not supported by attached service",
            Self::ChanDestroy => "User destroyed channel",
            Self::BadPriority => "Invalid channel priority",
            Self::NotThreaded => "Preemptive callback not enabled - additional threads may not join context",
            Self::Array16kClient => "Client’s protocol revision does not support transfers exceeding 16k bytes",
            Self::ConnSeqTmo => "Virtual circuit connection sequence aborted",
            Self::UnrespTmo => "Virtual circuit unresponsive",
        })
    }
}
