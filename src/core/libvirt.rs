use std::fmt;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::vm::{VmSpec, VmState};
use crate::gpu::pci::PciAddress;
use crate::state::models::NetworkInfo;

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("{operation} failed: {message}")]
    Command {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("Hypervisor unavailable: {0}")]
    Unavailable(String),
}

/// The hypervisor's name for a defined domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainHandle(pub String);

impl DomainHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Domain state as libvirt reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    /// Domain is not defined at all.
    Missing,
}

impl HypervisorState {
    fn from_domstate(raw: &str) -> Self {
        match raw.trim() {
            "running" => Self::Running,
            "idle" | "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "in shutdown" => Self::Shutdown,
            "shut off" => Self::Shutoff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    /// Whether a recorded lifecycle state is consistent with what the
    /// hypervisor reports. Transitional states are never flagged.
    pub fn agrees_with(&self, recorded: VmState) -> bool {
        use VmState::*;
        match recorded {
            Defining | Starting | Pausing | Stopping | Destroying | Error => true,
            Running => matches!(self, Self::Running | Self::Blocked),
            Paused => matches!(self, Self::Paused | Self::PmSuspended),
            Defined | Stopped => matches!(self, Self::Shutoff | Self::Shutdown),
            Undefined | Destroyed => matches!(self, Self::Missing),
        }
    }
}

/// What the lifecycle manager needs from a hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn define(&self, spec: &VmSpec) -> Result<DomainHandle, HypervisorError>;
    async fn start(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;
    async fn pause(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;
    async fn resume(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;
    async fn stop(&self, domain: &DomainHandle, graceful: bool) -> Result<(), HypervisorError>;
    /// Tear down and undefine the domain.
    async fn destroy(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;
    async fn attach_device(
        &self,
        domain: &DomainHandle,
        device: &PciAddress,
    ) -> Result<(), HypervisorError>;
    async fn detach_device(
        &self,
        domain: &DomainHandle,
        device: &PciAddress,
    ) -> Result<(), HypervisorError>;
    async fn query_state(&self, domain: &DomainHandle) -> Result<HypervisorState, HypervisorError>;

    async fn interface_addresses(
        &self,
        _domain: &DomainHandle,
    ) -> Result<Option<NetworkInfo>, HypervisorError> {
        Ok(None)
    }
}

/// [`Hypervisor`] backed by the `virsh` command line.
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    connection_uri: String,
    poll_interval: Duration,
}

impl VirshHypervisor {
    pub fn new(connection_uri: impl Into<String>) -> Self {
        Self {
            connection_uri: connection_uri.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    async fn virsh(&self, operation: &'static str, args: &[&str]) -> Result<String, HypervisorError> {
        debug!(operation, ?args, "virsh");
        let output = Command::new("virsh")
            .arg("-c")
            .arg(&self.connection_uri)
            .args(args)
            .output()
            .await
            .map_err(|e| HypervisorError::Unavailable(format!("could not run virsh: {e}")))?;

        if !output.status.success() {
            return Err(HypervisorError::Command {
                operation,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Write `xml` to a temporary file and hand its path to `virsh`.
    async fn virsh_with_xml(
        &self,
        operation: &'static str,
        xml: &str,
        args_before: &[&str],
        args_after: &[&str],
    ) -> Result<String, HypervisorError> {
        let io_err = |e: std::io::Error| HypervisorError::Command {
            operation,
            message: format!("could not write XML: {e}"),
        };
        let mut file = tempfile::Builder::new()
            .prefix("cgc-")
            .suffix(".xml")
            .tempfile()
            .map_err(io_err)?;
        file.write_all(xml.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        let path = file.path().to_string_lossy().into_owned();
        let mut args: Vec<&str> = args_before.to_vec();
        args.push(&path);
        args.extend_from_slice(args_after);
        self.virsh(operation, &args).await
    }
}

fn domain_xml(spec: &VmSpec) -> String {
    let interface = spec
        .bridge
        .as_deref()
        .map(|bridge| {
            format!(
                "<interface type='bridge'><source bridge='{bridge}'/><model type='virtio'/></interface>"
            )
        })
        .unwrap_or_default();

    // without a disk the domain can only network boot
    let (disk, boot) = match &spec.volume_path {
        Some(path) => (
            format!(
                "<disk type='file' device='disk'><driver name='qemu' type='qcow2'/><source file='{}'/><target dev='vda' bus='virtio'/></disk>",
                path.display()
            ),
            "hd",
        ),
        None => (String::new(), "network"),
    };

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='GiB'>{memory}</memory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='{boot}'/>
  </os>
  <features><acpi/><apic/></features>
  <cpu mode='host-passthrough'/>
  <devices>
    {disk}
    {interface}
  </devices>
</domain>"#,
        name = spec.name,
        memory = spec.resources.memory_gb,
        vcpus = spec.resources.cpu_cores,
    )
}

fn hostdev_xml(device: &PciAddress) -> String {
    // canonical form is dddd:bb:dd.f
    let (domain, rest) = device.as_str().split_at(4);
    let bus = &rest[1..3];
    let slot = &rest[4..6];
    let function = &rest[7..8];
    format!(
        "<hostdev mode='subsystem' type='pci' managed='yes'><source>\
         <address domain='0x{domain}' bus='0x{bus}' slot='0x{slot}' function='0x{function}'/>\
         </source></hostdev>"
    )
}

fn parse_domifaddr(output: &str) -> Option<NetworkInfo> {
    // Name  MAC address  Protocol  Address
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with('-'))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [_, mac, "ipv4", addr, ..] => Some(NetworkInfo {
                    ip_address: addr.split('/').next().map(str::to_string),
                    mac_address: Some(mac.to_string()),
                }),
                _ => None,
            }
        })
        .next()
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn define(&self, spec: &VmSpec) -> Result<DomainHandle, HypervisorError> {
        self.virsh_with_xml("define", &domain_xml(spec), &["define"], &[])
            .await?;
        info!("Domain {} defined", spec.name);
        Ok(DomainHandle(spec.name.clone()))
    }

    async fn start(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.virsh("start", &["start", domain.as_str()]).await?;
        info!("Domain {} started", domain);
        Ok(())
    }

    async fn pause(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.virsh("pause", &["suspend", domain.as_str()]).await?;
        Ok(())
    }

    async fn resume(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.virsh("resume", &["resume", domain.as_str()]).await?;
        Ok(())
    }

    async fn stop(&self, domain: &DomainHandle, graceful: bool) -> Result<(), HypervisorError> {
        if !graceful {
            self.virsh("stop", &["destroy", domain.as_str()]).await?;
            return Ok(());
        }

        self.virsh("stop", &["shutdown", domain.as_str()]).await?;
        // shutdown only asks the guest; wait for it to actually power off
        loop {
            match self.query_state(domain).await? {
                HypervisorState::Shutoff | HypervisorState::Missing => return Ok(()),
                state => {
                    debug!(domain = %domain, ?state, "Waiting for guest shutdown");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn destroy(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        match self.query_state(domain).await? {
            HypervisorState::Missing => {
                warn!(domain = %domain, "Domain already gone, nothing to destroy");
                return Ok(());
            }
            HypervisorState::Shutoff => {}
            _ => {
                self.virsh("destroy", &["destroy", domain.as_str()]).await?;
            }
        }
        self.virsh("destroy", &["undefine", domain.as_str()]).await?;
        info!("Domain {} destroyed", domain);
        Ok(())
    }

    async fn attach_device(
        &self,
        domain: &DomainHandle,
        device: &PciAddress,
    ) -> Result<(), HypervisorError> {
        self.virsh_with_xml(
            "attach_device",
            &hostdev_xml(device),
            &["attach-device", domain.as_str()],
            &["--config"],
        )
        .await?;
        info!(pci_address = %device, "Attached GPU to domain {}", domain);
        Ok(())
    }

    async fn detach_device(
        &self,
        domain: &DomainHandle,
        device: &PciAddress,
    ) -> Result<(), HypervisorError> {
        self.virsh_with_xml(
            "detach_device",
            &hostdev_xml(device),
            &["detach-device", domain.as_str()],
            &["--config"],
        )
        .await?;
        info!(pci_address = %device, "Detached GPU from domain {}", domain);
        Ok(())
    }

    async fn query_state(&self, domain: &DomainHandle) -> Result<HypervisorState, HypervisorError> {
        match self.virsh("query_state", &["domstate", domain.as_str()]).await {
            Ok(out) => Ok(HypervisorState::from_domstate(&out)),
            Err(HypervisorError::Command { message, .. })
                if message.contains("failed to get domain") =>
            {
                Ok(HypervisorState::Missing)
            }
            Err(e) => Err(e),
        }
    }

    async fn interface_addresses(
        &self,
        domain: &DomainHandle,
    ) -> Result<Option<NetworkInfo>, HypervisorError> {
        let out = self
            .virsh("interface_addresses", &["domifaddr", domain.as_str()])
            .await?;
        Ok(parse_domifaddr(&out))
    }
}
