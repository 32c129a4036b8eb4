//! Compute-system documents for the Host Compute Service.
//!
//! The v1 schema is PascalCase JSON; optional sections are skipped so the
//! submitted document only carries what the container actually uses.

use oci::BundlePaths;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct ComputeSystem {
    #[serde(rename = "SystemType")]
    pub system_type: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Owner")]
    pub owner: String,
    #[serde(rename = "ContainerType", skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,
    #[serde(rename = "LayerFolderPath", skip_serializing_if = "Option::is_none")]
    pub layer_folder_path: Option<String>,
    #[serde(rename = "Layers", skip_serializing_if = "Vec::is_empty", default)]
    pub layers: Vec<LayerEntry>,
    #[serde(rename = "HvPartition")]
    pub hv_partition: bool,
    #[serde(rename = "HvRuntime", skip_serializing_if = "Option::is_none")]
    pub hv_runtime: Option<HvRuntime>,
    #[serde(
        rename = "MappedDirectories",
        skip_serializing_if = "Vec::is_empty",
        default
    )]
    pub mapped_directories: Vec<MappedDirectory>,
    #[serde(rename = "EndpointList", skip_serializing_if = "Vec::is_empty", default)]
    pub endpoint_list: Vec<String>,
    #[serde(rename = "TerminateOnLastHandleClosed")]
    pub terminate_on_last_handle_closed: bool,
}

#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct LayerEntry {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct HvRuntime {
    #[serde(rename = "ImagePath")]
    pub image_path: String,
}

#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct MappedDirectory {
    #[serde(rename = "HostPath")]
    pub host_path: String,
    #[serde(rename = "ContainerPath")]
    pub container_path: String,
    #[serde(rename = "ReadOnly")]
    pub read_only: bool,
}

/// The document for a native Windows container, optionally Hyper-V
/// isolated with a validated utility VM.
pub fn wcow_document(
    id: &str,
    layer_folder: &Path,
    layers: &[std::path::PathBuf],
    utility_vm: Option<&Path>,
) -> ComputeSystem {
    ComputeSystem {
        system_type: "Container".to_string(),
        name: id.to_string(),
        owner: "containerv".to_string(),
        container_type: None,
        layer_folder_path: Some(layer_folder.display().to_string()),
        layers: layers
            .iter()
            .map(|path| LayerEntry {
                id: layer_entry_id(path),
                path: path.display().to_string(),
            })
            .collect(),
        hv_partition: utility_vm.is_some(),
        hv_runtime: utility_vm.map(|path| HvRuntime {
            image_path: path.display().to_string(),
        }),
        mapped_directories: Vec::new(),
        endpoint_list: Vec::new(),
        terminate_on_last_handle_closed: true,
    }
}

/// The document for a Linux container inside a utility VM: the bundle
/// rootfs lands at `/chef/rootfs`, the staging area at `/chef/staging`.
pub fn lcow_document(id: &str, bundle: &BundlePaths, uvm_image: &Path) -> ComputeSystem {
    let staging = bundle
        .bundle_dir()
        .parent()
        .map(|runtime| runtime.join("staging"))
        .unwrap_or_else(|| bundle.bundle_dir().join("staging"));

    ComputeSystem {
        system_type: "Container".to_string(),
        name: id.to_string(),
        owner: "containerv".to_string(),
        container_type: Some("Linux".to_string()),
        layer_folder_path: None,
        layers: Vec::new(),
        hv_partition: true,
        hv_runtime: Some(HvRuntime {
            image_path: uvm_image.display().to_string(),
        }),
        mapped_directories: vec![
            MappedDirectory {
                host_path: bundle.rootfs_dir().display().to_string(),
                container_path: "/chef/rootfs".to_string(),
                read_only: false,
            },
            MappedDirectory {
                host_path: staging.display().to_string(),
                container_path: "/chef/staging".to_string(),
                read_only: false,
            },
        ],
        endpoint_list: Vec::new(),
        terminate_on_last_handle_closed: true,
    }
}

/// A stable per-layer id derived from the layer directory name.
fn layer_entry_id(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::path::PathBuf;

    #[test]
    fn wcow_shape() -> Result<()> {
        let layers = vec![PathBuf::from("C:\\layers\\base")];
        let document = wcow_document("abc", Path::new("C:\\layers\\top"), &layers, None);
        let text = serde_json::to_string(&document)?;

        assert!(text.contains("\"SystemType\":\"Container\""));
        assert!(text.contains("\"LayerFolderPath\""));
        assert!(text.contains("\"HvPartition\":false"));
        assert!(!text.contains("HvRuntime"));
        assert!(!text.contains("ContainerType"));
        Ok(())
    }

    #[test]
    fn wcow_hyperv_carries_runtime() -> Result<()> {
        let layers = vec![PathBuf::from("C:\\layers\\base")];
        let document = wcow_document(
            "abc",
            Path::new("C:\\layers\\top"),
            &layers,
            Some(Path::new("C:\\layers\\base\\UtilityVM")),
        );

        assert!(document.hv_partition);
        assert_eq!(
            document.hv_runtime.unwrap().image_path,
            "C:\\layers\\base\\UtilityVM"
        );
        Ok(())
    }

    #[test]
    fn lcow_maps_rootfs_and_staging() -> Result<()> {
        let bundle = oci::bundle::get_paths(Path::new("/tmp/containerv-abc"));
        let document = lcow_document("abc", &bundle, Path::new("/images/uvm"));

        assert_eq!(document.container_type.as_deref(), Some("Linux"));
        assert!(document.hv_partition);
        assert_eq!(document.mapped_directories.len(), 2);
        assert_eq!(document.mapped_directories[0].container_path, "/chef/rootfs");
        assert_eq!(
            document.mapped_directories[1].host_path,
            "/tmp/containerv-abc/staging"
        );
        Ok(())
    }

    #[test]
    fn document_round_trips() -> Result<()> {
        let bundle = oci::bundle::get_paths(Path::new("/tmp/containerv-x"));
        let document = lcow_document("x", &bundle, Path::new("/images/uvm"));
        let text = serde_json::to_string(&document)?;
        let parsed: ComputeSystem = serde_json::from_str(&text)?;
        assert_eq!(parsed, document);
        Ok(())
    }
}
