//! Closed status vocabularies for every queue table.
//!
//! Status columns are stored as text. Reading an unknown value back is a
//! construction-time [`DomainError::Validation`], never a silently skipped branch.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Common behaviour of a pipeline status enum.
pub trait JobState:
    Copy + Eq + fmt::Debug + fmt::Display + FromStr<Err = DomainError> + Send + Sync + 'static
{
    /// Every variant, in declaration order.
    const ALL: &'static [Self];

    /// The persisted spelling.
    fn as_str(&self) -> &'static str;

    /// No automatic transition leaves a terminal state.
    fn is_terminal(&self) -> bool;
}

macro_rules! job_states {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
        terminal: [$($terminal:ident),*]
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl JobState for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            fn is_terminal(&self) -> bool {
                matches!(self, $(Self::$terminal)|*)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DomainError::validation(format!(
                        "unknown {} value: {other:?}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

job_states! {
    /// Multi-step catalog report sync.
    pub enum CatalogSyncStatus {
        Pending => "pending",
        WorkerStarted => "worker_started",
        WorkerFetching => "worker_fetching",
        WorkerFetched => "worker_fetched",
        Completed => "completed",
        Error => "error",
    }
    terminal: [Completed]
}

job_states! {
    /// Parent row of a two-phase listing sync.
    pub enum ListingSyncStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Error => "error",
    }
    terminal: [Completed, Error]
}

job_states! {
    /// Which phase of a listing sync is currently authoritative.
    pub enum ListingStage {
        Pending => "pending",
        Request => "request",
        Import => "import",
        Completed => "completed",
    }
    terminal: [Completed]
}

job_states! {
    /// Request and import phase rows of a listing sync.
    pub enum ListingPhaseStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Fail => "fail",
        Error => "error",
    }
    terminal: [Completed, Error]
}

job_states! {
    /// Windowed order sync per (user, marketplace).
    pub enum OrderSyncStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Fail => "fail",
        Skipped => "skipped",
    }
    terminal: [Completed, Skipped]
}

job_states! {
    /// Per-order line item sync.
    pub enum OrderItemsStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Fail => "fail",
        Skipped => "skipped",
    }
    terminal: [Completed, Skipped]
}

job_states! {
    /// Secondary identifier (EAN/UPC/GTIN) awaiting an ASIN.
    pub enum IdentifierStatus {
        Pending => "pending",
        Processing => "processing",
        Resolved => "resolved",
        Ambiguous => "ambiguous",
        NotFound => "not_found",
        Failed => "failed",
    }
    terminal: [Resolved, Ambiguous, NotFound, Failed]
}

job_states! {
    /// Scheduled review solicitation for one (order, asin) pair.
    pub enum ReviewRequestStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
    terminal: [Completed]
}
