//! Server runtime state as reported by `show servers state`.
//!
//! The numeric columns map onto HAProxy's internal enums and flag sets.

use std::collections::HashMap;

use crate::errors::{Error, Result};

/// Decoding of a bit set column into its individual flags.
pub trait Flags: Sized + Copy + 'static {
    const ALL: &'static [Self];

    fn bit(self) -> u32;

    fn flags(value: u32) -> Vec<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|f| value & f.bit() != 0)
            .collect()
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];
        }

        impl TryFrom<u32> for $name {
            type Error = Error;

            fn try_from(value: u32) -> Result<Self> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| *v as u32 == value)
                    .ok_or_else(|| {
                        Error::Protocol(format!("{} is not a valid {}", value, stringify!($name)))
                    })
            }
        }
    };
}

macro_rules! flag_set {
    ($name:ident) => {
        impl Flags for $name {
            const ALL: &'static [Self] = $name::ALL;

            fn bit(self) -> u32 {
                self as u32
            }
        }
    };
}

wire_enum!(ServerState {
    /// Down.
    Stopped = 0,
    /// Up but throttled while warming up.
    Starting = 1,
    Running = 2,
    /// Up but soft-stopping (e.g. answering 404 to checks).
    Stopping = 3,
});

wire_enum!(ServerAdmin {
    /// Explicitly forced into maintenance.
    ForcedMaintenance = 0x01,
    /// Maintenance inherited from a tracked server.
    InheritedMaintenance = 0x02,
    /// Maintenance because of the configuration.
    ConfigMaintenance = 0x04,
    ForcedDrain = 0x08,
    InheritedDrain = 0x10,
});
flag_set!(ServerAdmin);

wire_enum!(CheckResult {
    Unknown = 0,
    /// Valid check but no status information.
    Neutral = 1,
    Failed = 2,
    Passed = 3,
    /// Server doesn't want new sessions.
    ConditionalPass = 4,
});

wire_enum!(CheckState {
    InProgress = 0x01,
    Configured = 0x02,
    Enabled = 0x04,
    /// Paused because of maintenance (health checks only).
    Paused = 0x08,
    /// Agent check rather than health check.
    Agent = 0x10,
});
flag_set!(CheckState);

wire_enum!(CheckStatus {
    Unknown = 0,
    Initializing = 1,
    Started = 2,
    Checked = 3,
    /// Health analysis saw enough consecutive errors.
    HealthAnalyze = 4,
    SocketError = 5,
    L4Ok = 6,
    L4Timeout = 7,
    L4Connection = 8,
    L6Ok = 9,
    L6Timeout = 10,
    L6Response = 11,
    L7Timeout = 12,
    L7Response = 13,
    L57Data = 14,
    L7Ok = 15,
    L7OkConditional = 16,
    L7Status = 17,
    ProcessError = 18,
    ProcessTimeout = 19,
    ProcessOk = 20,
});

/// One row of `show servers state`.
#[derive(Debug, Clone)]
pub struct RuntimeServerState {
    pub backend: String,
    pub name: String,
    pub address: String,
    pub op_state: ServerState,
    pub admin_state: Vec<ServerAdmin>,
    pub check_status: CheckStatus,
    pub check_result: CheckResult,
    pub check_state: Vec<CheckState>,
    /// Every column of the row keyed by header name.
    pub fields: HashMap<String, String>,
}

impl RuntimeServerState {
    pub fn is_disabled(&self) -> bool {
        self.admin_state.contains(&ServerAdmin::ForcedMaintenance)
    }

    /// One line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "{}/{} at {} is {:?} (admin {:?}, weight {}), check {:?}/{:?} {:?}",
            self.backend,
            self.name,
            self.address,
            self.op_state,
            self.admin_state,
            self.fields.get("srv_uweight").map(String::as_str).unwrap_or("?"),
            self.check_status,
            self.check_result,
            self.check_state,
        )
    }
}

/// Server name -> state, for one backend.
pub type ServersState = HashMap<String, RuntimeServerState>;

const STATE_VERSION: &str = "1";

/// Parses the lines of a `show servers state` response.
pub fn parse_servers_state(lines: &[String]) -> Result<ServersState> {
    let mut lines = lines.iter();

    match lines.next() {
        Some(version) if version.trim() == STATE_VERSION => {}
        other => {
            return Err(Error::Protocol(format!(
                "unsupported servers state version {:?}",
                other
            )))
        }
    }

    let header = lines
        .next()
        .ok_or_else(|| Error::Protocol("servers state without a header".into()))?;
    let mut columns: Vec<&str> = header.split_whitespace().collect();
    // the header is marked with '#', either standalone or glued to the first name
    match columns.first().copied() {
        Some("#") => {
            columns.remove(0);
        }
        Some(first) if first.starts_with('#') => columns[0] = &first[1..],
        _ => {}
    }

    let mut state = ServersState::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: HashMap<String, String> = columns
            .iter()
            .zip(line.split(' '))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let server = decode_row(fields)?;
        state.insert(server.name.clone(), server);
    }

    Ok(state)
}

fn decode_row(fields: HashMap<String, String>) -> Result<RuntimeServerState> {
    let text = |key: &str| -> Result<String> {
        fields
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("missing column {}", key)))
    };
    let number = |key: &str| -> Result<u32> {
        let value = text(key)?;
        value
            .parse()
            .map_err(|_| Error::Protocol(format!("{}={:?} is not a number", key, value)))
    };

    Ok(RuntimeServerState {
        backend: text("be_name")?,
        name: text("srv_name")?,
        address: text("srv_addr")?,
        op_state: ServerState::try_from(number("srv_op_state")?)?,
        admin_state: ServerAdmin::flags(number("srv_admin_state")?),
        check_status: CheckStatus::try_from(number("srv_check_status")?)?,
        check_result: CheckResult::try_from(number("srv_check_result")?)?,
        check_state: CheckState::flags(number("srv_check_state")?),
        fields,
    })
}
