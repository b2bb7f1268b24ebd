/// Local-link detection: is any non-loopback interface up?
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde::Deserialize;

/// What to report when the interface list cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationErrorPolicy {
    /// Report no link. Upstream this is a definite loss.
    #[default]
    AssumeDown,
    /// Report a link and let the remote probes decide.
    AssumeUp,
}

/// One host interface, flattened from the per-address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
}

/// Reports whether the host has a usable local link.
pub trait LinkDetector: Send + Sync {
    fn has_active_local_link(&self) -> bool;
}

/// True iff some interface not in `ignore` is up and not loopback.
pub fn any_active(interfaces: &[InterfaceInfo], ignore: &[String]) -> bool {
    interfaces
        .iter()
        .filter(|i| !ignore.iter().any(|name| name == &i.name))
        .any(|i| i.up && !i.loopback)
}

/// Detector reading the live interface table via `getifaddrs(3)`.
#[derive(Debug, Clone, Default)]
pub struct SystemLinkDetector {
    on_error: EnumerationErrorPolicy,
    ignore: Vec<String>,
}

impl SystemLinkDetector {
    pub fn new(on_error: EnumerationErrorPolicy, ignore: Vec<String>) -> Self {
        Self { on_error, ignore }
    }

    /// List interfaces, one entry per name.
    pub fn interfaces() -> Result<Vec<InterfaceInfo>, nix::Error> {
        let mut out: Vec<InterfaceInfo> = Vec::new();
        for ifaddr in getifaddrs()? {
            if out.iter().any(|i| i.name == ifaddr.interface_name) {
                continue;
            }
            out.push(InterfaceInfo {
                up: ifaddr.flags.contains(InterfaceFlags::IFF_UP),
                loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                name: ifaddr.interface_name,
            });
        }
        Ok(out)
    }

    fn resolve(&self, listing: Result<Vec<InterfaceInfo>, nix::Error>) -> bool {
        match listing {
            Ok(interfaces) => {
                let up = any_active(&interfaces, &self.ignore);
                if !up {
                    tracing::debug!(
                        interfaces = interfaces.len(),
                        "no non-loopback interface is up"
                    );
                }
                up
            }
            Err(e) => {
                let assume = self.on_error == EnumerationErrorPolicy::AssumeUp;
                tracing::warn!(
                    error = %e,
                    policy = ?self.on_error,
                    "interface enumeration failed, reporting link {}",
                    if assume { "up" } else { "down" }
                );
                assume
            }
        }
    }
}

impl LinkDetector for SystemLinkDetector {
    fn has_active_local_link(&self) -> bool {
        self.resolve(Self::interfaces())
    }
}
