//! The Windows Host Compute Service backend.
//!
//! Layerchain resolution and the compute-system documents are portable and
//! tested everywhere; only the dynamically-bound HCS/HNS calls live behind
//! the Windows gate.

#[cfg(windows)]
pub(crate) mod api;
pub mod schema;

use agent::Transport;
use common::{Error, Result};
use log::{debug, warn};
use oci::BundlePaths;
use std::path::{Path, PathBuf};

/// State shared by both HCS-backed container flavours.
#[derive(Debug, Default)]
pub struct HcsCommon {
    /// Name the compute system was registered under.
    pub(crate) system_id: String,
    /// Attached HNS endpoint, when networking was requested.
    pub(crate) endpoint_id: Option<String>,
    #[cfg(windows)]
    pub(crate) system: Option<api::ComputeSystemHandle>,
}

#[derive(Debug, Default)]
/// Realised state of a native Windows container.
pub struct WcowState {
    common: HcsCommon,
    layer_folder: PathBuf,
    layers: Vec<PathBuf>,
    hyperv: bool,
}

impl WcowState {
    pub(crate) fn common_mut(&mut self) -> &mut HcsCommon {
        &mut self.common
    }

    /// The resolved parent layer chain.
    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// The windowsfilter folder this container was created from.
    pub fn layer_folder(&self) -> &Path {
        &self.layer_folder
    }

    /// Whether Hyper-V isolation was requested.
    pub fn hyperv(&self) -> bool {
        self.hyperv
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
/// Realised state of a Linux container inside a utility VM.
pub struct LcowState {
    common: HcsCommon,
    bundle: BundlePaths,
    uvm_image: PathBuf,
}

impl LcowState {
    pub(crate) fn common_mut(&mut self) -> &mut HcsCommon {
        &mut self.common
    }

    /// The utility VM image backing this container.
    pub fn uvm_image(&self) -> &Path {
        &self.uvm_image
    }

    /// The OCI bundle attached to the utility VM.
    pub fn bundle(&self) -> &BundlePaths {
        &self.bundle
    }
}

/// Parse and resolve `layerchain.json` in a windowsfilter layer folder.
/// Relative or missing entries are resolved against the folder and its
/// `parents` subdirectory; the file is rewritten only when resolution
/// changed an entry.
pub fn resolve_layerchain(folder: &Path) -> Result<Vec<PathBuf>> {
    let chain_path = folder.join("layerchain.json");
    let text = std::fs::read_to_string(&chain_path)
        .map_err(|e| Error::from_io(format!("read {}", chain_path.display()), e))?;
    let entries: Vec<String> = serde_json::from_str(&text)
        .map_err(|e| Error::invalid(format!("parse {}: {}", chain_path.display(), e)))?;

    let mut resolved = Vec::with_capacity(entries.len());
    let mut changed = false;
    for entry in &entries {
        let path = resolve_layer_entry(folder, entry)?;
        if path.as_os_str() != std::ffi::OsStr::new(entry) {
            changed = true;
        }
        resolved.push(path);
    }

    if changed {
        debug!("Rewriting resolved layerchain {}", chain_path.display());
        let rewritten = resolved
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>();
        let text = serde_json::to_string(&rewritten)
            .map_err(|e| Error::invalid(format!("serialize layerchain: {}", e)))?;
        common::fs::write_text_file(&chain_path, &text)?;
    }
    Ok(resolved)
}

/// Resolve one layerchain entry to an existing directory.
fn resolve_layer_entry(folder: &Path, entry: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(entry);
    if direct.is_absolute() && direct.exists() {
        return Ok(direct);
    }

    let name = direct
        .file_name()
        .ok_or_else(|| Error::invalid(format!("layerchain entry {} has no name", entry)))?;
    for candidate in [folder.join(name), folder.join("parents").join(name)] {
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::not_found(format!(
        "layer {} not under {} or its parents",
        entry,
        folder.display()
    )))
}

/// Validate the utility VM under a base layer: either `UtilityVM.vhdx` or
/// `UtilityVM/Files/` must exist.
pub fn validate_utility_vm(base_layer: &Path) -> Result<PathBuf> {
    let vhdx = base_layer.join("UtilityVM.vhdx");
    if vhdx.is_file() {
        return Ok(vhdx);
    }
    let files = base_layer.join("UtilityVM").join("Files");
    if files.is_dir() {
        return Ok(files);
    }
    Err(Error::not_found(format!(
        "no utility VM under {}",
        base_layer.display()
    )))
}

/// Realise a native Windows container.
pub async fn realize_wcow(
    id: &str,
    layer_folder: &Path,
    hyperv: bool,
    enable_network: bool,
) -> Result<WcowState> {
    let layers = resolve_layerchain(layer_folder)?;

    let utility_vm = if hyperv {
        let base = layers
            .last()
            .ok_or_else(|| Error::invalid("layerchain has no base layer"))?;
        Some(validate_utility_vm(base)?)
    } else {
        None
    };

    #[cfg(windows)]
    {
        let document = schema::wcow_document(id, layer_folder, &layers, utility_vm.as_deref());
        let system = api::create_and_start(id, &document).await?;
        let endpoint_id = if enable_network {
            Some(api::attach_endpoint(id).await?)
        } else {
            None
        };
        Ok(WcowState {
            common: HcsCommon {
                system_id: id.to_string(),
                endpoint_id,
                system: Some(system),
            },
            layer_folder: layer_folder.to_path_buf(),
            layers,
            hyperv,
        })
    }
    #[cfg(not(windows))]
    {
        let _ = (id, enable_network, utility_vm, layers);
        Err(Error::invalid("the HCS backend requires a Windows host"))
    }
}

/// Realise a Linux container inside a utility VM from a prepared bundle.
pub async fn realize_lcow(
    id: &str,
    bundle: &BundlePaths,
    uvm_image: &Path,
    enable_network: bool,
) -> Result<LcowState> {
    if !uvm_image.exists() {
        return Err(Error::not_found(format!(
            "utility VM image {}",
            uvm_image.display()
        )));
    }

    #[cfg(windows)]
    {
        let document = schema::lcow_document(id, bundle, uvm_image);
        let system = api::create_and_start(id, &document).await?;
        let endpoint_id = if enable_network {
            Some(api::attach_endpoint(id).await?)
        } else {
            None
        };
        Ok(LcowState {
            common: HcsCommon {
                system_id: id.to_string(),
                endpoint_id,
                system: Some(system),
            },
            bundle: bundle.clone(),
            uvm_image: uvm_image.to_path_buf(),
        })
    }
    #[cfg(not(windows))]
    {
        let _ = (id, bundle, enable_network);
        Err(Error::invalid("the HCS backend requires a Windows host"))
    }
}

/// Start the in-guest agent and hand back its stdio transport.
pub async fn start_agent(state: &mut LcowState) -> Result<Box<dyn Transport>> {
    #[cfg(windows)]
    {
        let system = state
            .common
            .system
            .as_ref()
            .ok_or_else(|| Error::invalid("compute system is not running"))?;
        api::start_guest_process(system, "/chef/pid1d").await
    }
    #[cfg(not(windows))]
    {
        let _ = state;
        Err(Error::invalid("the HCS backend requires a Windows host"))
    }
}

/// Best-effort teardown of a compute system and its endpoint.
pub async fn teardown(common: &mut HcsCommon) {
    if let Some(endpoint) = common.endpoint_id.take() {
        #[cfg(windows)]
        if let Err(e) = api::detach_endpoint(&common.system_id, &endpoint).await {
            warn!("Endpoint {} detach failed: {}", endpoint, e);
        }
        #[cfg(not(windows))]
        warn!("Dropping endpoint {} without a Windows host", endpoint);
    }

    #[cfg(windows)]
    if let Some(system) = common.system.take() {
        if let Err(e) = api::terminate_and_close(system).await {
            warn!("Compute system {} teardown failed: {}", common.system_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    fn write_chain(folder: &Path, entries: &[&str]) -> Result<()> {
        std::fs::write(
            folder.join("layerchain.json"),
            serde_json::to_string(&entries)?,
        )?;
        Ok(())
    }

    #[test]
    fn layerchain_absolute_entries_kept() -> Result<()> {
        let dir = TempDir::new()?;
        let base = dir.path().join("base");
        std::fs::create_dir(&base)?;
        write_chain(dir.path(), &[&base.display().to_string()])?;

        let resolved = resolve_layerchain(dir.path())?;
        assert_eq!(resolved, vec![base]);

        // Unchanged chains are not rewritten.
        let text = std::fs::read_to_string(dir.path().join("layerchain.json"))?;
        let entries: Vec<String> = serde_json::from_str(&text)?;
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[test]
    fn layerchain_relative_entries_resolved_and_rewritten() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("parents/base-layer"))?;
        write_chain(dir.path(), &["C:\\gone\\base-layer"])?;

        let resolved = resolve_layerchain(dir.path())?;
        assert_eq!(resolved, vec![dir.path().join("parents/base-layer")]);

        let text = std::fs::read_to_string(dir.path().join("layerchain.json"))?;
        assert!(text.contains("parents"));
        Ok(())
    }

    #[test]
    fn layerchain_missing_entry_is_not_found() -> Result<()> {
        let dir = TempDir::new()?;
        write_chain(dir.path(), &["C:\\gone\\nowhere"])?;

        let err = resolve_layerchain(dir.path()).unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn layerchain_must_exist_and_parse() -> Result<()> {
        let dir = TempDir::new()?;
        let err = resolve_layerchain(dir.path()).unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);

        std::fs::write(dir.path().join("layerchain.json"), "not json")?;
        let err = resolve_layerchain(dir.path()).unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Invalid);
        Ok(())
    }

    #[test]
    fn utility_vm_validation() -> Result<()> {
        let dir = TempDir::new()?;
        let err = validate_utility_vm(dir.path()).unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);

        std::fs::create_dir_all(dir.path().join("UtilityVM/Files"))?;
        assert_eq!(
            validate_utility_vm(dir.path())?,
            dir.path().join("UtilityVM/Files")
        );

        std::fs::write(dir.path().join("UtilityVM.vhdx"), "vhdx")?;
        assert_eq!(
            validate_utility_vm(dir.path())?,
            dir.path().join("UtilityVM.vhdx")
        );
        Ok(())
    }

    #[tokio::test]
    async fn lcow_requires_existing_image() -> Result<()> {
        let dir = TempDir::new()?;
        let bundle = oci::bundle::get_paths(dir.path());
        let err = realize_lcow("abc", &bundle, Path::new("/missing/uvm"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::NotFound);
        Ok(())
    }
}
