use ipnetwork::Ipv4Network;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("machine {0:?} does not exist")]
    MachineNotFound(String),

    #[error("host-only network does not exist")]
    HostonlyNetworkNotFound,

    #[error("DHCP server for {0:?} does not exist")]
    DhcpServerNotFound(String),

    #[error("`{program} {args}` failed ({status}): {stderr}")]
    Command {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },

    #[error("could not parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("subnet {0} is too small for a DHCP lease pool")]
    SubnetTooSmall(Ipv4Network),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Parse {
            what,
            detail: detail.into(),
        }
    }
}
