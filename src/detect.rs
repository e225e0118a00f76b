//! Classify the hypervisor the host is running under, if any.
//!
//! The result drives two decisions: whether the Hyper-V feature has to be
//! enabled before installing the container runtime, and which backend the
//! runtime installer is told to use. Whether the host hypervisor exposes
//! nested virtualization is not checked here, the runtime reports that itself
//! when it starts.
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::exec::{powershell_args, Execute, ExecuteError};

#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    #[error("Could not query hardware inventory: {0}")]
    Execute(#[from] ExecuteError),
    #[error("Hardware inventory query failed with code {0}: {1}")]
    Query(i32, String),
    #[error("Could not parse hardware inventory: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Could not read {0}: {1}")]
    Read(PathBuf, std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorClass {
    /// Physical machine, or nothing recognizable
    None,
    HyperV,
    VMware,
    VirtualBox,
    /// Looks virtual but the vendor is not one we know about
    UnknownVirtual,
}

impl HypervisorClass {
    /// Only Hyper-V guests need the Windows virtualization feature before the
    /// container runtime can be installed
    pub fn needs_virtualization_feature(&self) -> bool {
        matches!(self, HypervisorClass::HyperV)
    }

    pub fn backend(&self) -> RuntimeBackend {
        match self {
            HypervisorClass::HyperV => RuntimeBackend::HyperV,
            _ => RuntimeBackend::Default,
        }
    }

    pub fn is_virtual(&self) -> bool {
        !matches!(self, HypervisorClass::None)
    }
}

impl std::fmt::Display for HypervisorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HypervisorClass::None => "none",
            HypervisorClass::HyperV => "hyper-v",
            HypervisorClass::VMware => "vmware",
            HypervisorClass::VirtualBox => "virtualbox",
            HypervisorClass::UnknownVirtual => "unknown-virtual",
        };
        f.write_str(name)
    }
}

/// Lower-level backend the container runtime installer is configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    HyperV,
    Default,
}

impl RuntimeBackend {
    pub fn installer_argument(&self) -> Option<&'static str> {
        match self {
            RuntimeBackend::HyperV => Some("--backend=hyper-v"),
            RuntimeBackend::Default => None,
        }
    }
}

impl std::fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeBackend::HyperV => f.write_str("hyper-v"),
            RuntimeBackend::Default => f.write_str("default"),
        }
    }
}

/// Identification strings exposed by the firmware
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemIdentity {
    pub manufacturer: String,
    pub model: String,
    pub bios_vendor: String,
    pub bios_version: String,
}

const UNKNOWN_VIRTUAL_SIGNATURES: [&str; 6] = ["qemu", "kvm", "xen", "parallels", "bochs", "bhyve"];

impl SystemIdentity {
    /// Match the identity against known signatures. Order matters: Hyper-V
    /// first, then VMware, VirtualBox and the generic fallback.
    pub fn classify(&self) -> HypervisorClass {
        let manufacturer = self.manufacturer.to_lowercase();
        let model = self.model.to_lowercase();
        let bios_vendor = self.bios_vendor.to_lowercase();
        let bios_version = self.bios_version.to_lowercase();
        let all = [&manufacturer, &model, &bios_vendor, &bios_version];
        let any = |needle: &str| all.iter().any(|s| s.contains(needle));

        if (manufacturer.contains("microsoft corporation") && model.contains("virtual machine"))
            || bios_version.contains("hyper-v")
        {
            HypervisorClass::HyperV
        } else if any("vmware") {
            HypervisorClass::VMware
        } else if any("virtualbox") || any("innotek") {
            HypervisorClass::VirtualBox
        } else if UNKNOWN_VIRTUAL_SIGNATURES.iter().any(|s| any(*s)) || model.contains("virtual") {
            HypervisorClass::UnknownVirtual
        } else {
            HypervisorClass::None
        }
    }
}

/// Source of [SystemIdentity] facts
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn read(&self) -> Result<SystemIdentity, DetectError>;
}

/// Reads the identity from WMI through PowerShell
#[derive(Debug)]
pub struct CimInventory<E> {
    executor: E,
}

impl<E: Execute> CimInventory<E> {
    pub fn new(executor: E) -> CimInventory<E> {
        CimInventory { executor }
    }
}

const CIM_QUERY: &str = "$cs = Get-CimInstance -ClassName Win32_ComputerSystem; \
$bios = Get-CimInstance -ClassName Win32_BIOS; \
[pscustomobject]@{ manufacturer = $cs.Manufacturer; model = $cs.Model; \
bios_vendor = $bios.Manufacturer; bios_version = $bios.SMBIOSBIOSVersion } | ConvertTo-Json -Compress";

#[derive(Debug, Deserialize)]
struct CimIdentity {
    manufacturer: Option<String>,
    model: Option<String>,
    bios_vendor: Option<String>,
    bios_version: Option<String>,
}

impl From<CimIdentity> for SystemIdentity {
    fn from(raw: CimIdentity) -> SystemIdentity {
        SystemIdentity {
            manufacturer: raw.manufacturer.unwrap_or_default(),
            model: raw.model.unwrap_or_default(),
            bios_vendor: raw.bios_vendor.unwrap_or_default(),
            bios_version: raw.bios_version.unwrap_or_default(),
        }
    }
}

pub(crate) fn parse_cim_identity(json: &str) -> Result<SystemIdentity, DetectError> {
    let raw: CimIdentity = serde_json::from_str(json.trim())?;
    Ok(raw.into())
}

#[async_trait]
impl<E: Execute> Inventory for CimInventory<E> {
    async fn read(&self) -> Result<SystemIdentity, DetectError> {
        let out = self
            .executor
            .run("powershell", &powershell_args(CIM_QUERY))
            .await?;
        if !out.success() {
            return Err(DetectError::Query(out.code, out.trimmed().to_string()));
        }
        parse_cim_identity(&out.output)
    }
}

/// Reads the identity from the DMI tables exported by Linux in sysfs
#[derive(Debug)]
pub struct DmiInventory {
    root: PathBuf,
}

impl Default for DmiInventory {
    fn default() -> Self {
        DmiInventory::new("/sys/class/dmi/id")
    }
}

impl DmiInventory {
    pub fn new(root: impl Into<PathBuf>) -> DmiInventory {
        DmiInventory { root: root.into() }
    }

    async fn field(&self, name: &str) -> Result<String, DetectError> {
        let path = self.root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map(|s| s.trim().to_string())
            .map_err(|e| DetectError::Read(path, e))
    }
}

#[async_trait]
impl Inventory for DmiInventory {
    async fn read(&self) -> Result<SystemIdentity, DetectError> {
        Ok(SystemIdentity {
            manufacturer: self.field("sys_vendor").await?,
            model: self.field("product_name").await?,
            bios_vendor: self.field("bios_vendor").await?,
            bios_version: self.field("bios_version").await?,
        })
    }
}

/// Classify the host. Failing to read the inventory is reported and treated as
/// a physical machine.
pub async fn detect<I: Inventory + ?Sized>(inventory: &I) -> HypervisorClass {
    match inventory.read().await {
        Ok(identity) => {
            debug!("System identity: {:?}", identity);
            let class = identity.classify();
            info!("Detected hypervisor: {}", class);
            class
        }
        Err(e) => {
            warn!("Could not detect virtualization, assuming a physical machine: {}", e);
            HypervisorClass::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(manufacturer: &str, model: &str, bios_vendor: &str, bios_version: &str) -> SystemIdentity {
        SystemIdentity {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            bios_vendor: bios_vendor.to_string(),
            bios_version: bios_version.to_string(),
        }
    }

    #[test]
    fn hyperv_guest() {
        let id = identity(
            "Microsoft Corporation",
            "Virtual Machine",
            "Microsoft Corporation",
            "Hyper-V UEFI Release v4.1",
        );
        assert_eq!(id.classify(), HypervisorClass::HyperV);
        assert_eq!(id.classify().backend(), RuntimeBackend::HyperV);
    }

    #[test]
    fn surface_is_physical() {
        let id = identity("Microsoft Corporation", "Surface Laptop 5", "Microsoft Corporation", "1.2.3");
        assert_eq!(id.classify(), HypervisorClass::None);
    }

    #[test]
    fn vmware_guest() {
        let id = identity("VMware, Inc.", "VMware7,1", "VMware, Inc.", "VMW71.00V");
        assert_eq!(id.classify(), HypervisorClass::VMware);
        assert_eq!(id.classify().backend(), RuntimeBackend::Default);
    }

    #[test]
    fn virtualbox_guest() {
        let id = identity("innotek GmbH", "VirtualBox", "innotek GmbH", "VirtualBox");
        assert_eq!(id.classify(), HypervisorClass::VirtualBox);
    }

    #[test]
    fn qemu_guest_is_unknown_virtual() {
        let id = identity("QEMU", "Standard PC (Q35 + ICH9, 2009)", "SeaBIOS", "1.16.0");
        assert_eq!(id.classify(), HypervisorClass::UnknownVirtual);
        assert!(!id.classify().needs_virtualization_feature());
    }

    #[test]
    fn physical_machine() {
        let id = identity("Dell Inc.", "OptiPlex 7090", "Dell Inc.", "1.14.0");
        assert_eq!(id.classify(), HypervisorClass::None);
    }

    #[test]
    fn parse_cim_output_with_nulls() {
        let id = parse_cim_identity(
            r#"{"manufacturer":"Microsoft Corporation","model":"Virtual Machine","bios_vendor":null,"bios_version":null}"#,
        )
        .unwrap();
        assert_eq!(id.bios_vendor, "");
        assert_eq!(id.classify(), HypervisorClass::HyperV);
    }

    #[tokio::test]
    async fn unreadable_inventory_is_physical() {
        let inventory = DmiInventory::new("/nonexistent/dmi");
        assert_eq!(detect(&inventory).await, HypervisorClass::None);
    }

    #[tokio::test]
    async fn dmi_inventory_reads_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [
            ("sys_vendor", "innotek GmbH\n"),
            ("product_name", "VirtualBox\n"),
            ("bios_vendor", "innotek GmbH\n"),
            ("bios_version", "VirtualBox\n"),
        ] {
            std::fs::write(dir.path().join(name), value).unwrap();
        }
        let inventory = DmiInventory::new(dir.path());
        assert_eq!(detect(&inventory).await, HypervisorClass::VirtualBox);
    }
}
