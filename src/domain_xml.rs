//! Typed view of a libvirt domain definition.
//!
//! Only the parts the mover needs are extracted: name, vCPU count, memory,
//! VNC port and the migratable disks. Everything format-specific stays here.

use crate::guest::DiskBackend;
use crate::{MoveError, Result, log_warn};
use roxmltree::{Document, Node};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSource {
    pub path: String,
    pub backend: DiskBackend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDefinition {
    pub name: String,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub vnc_port: Option<u16>,
    pub disks: Vec<DiskSource>,
}

impl DomainDefinition {
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();
        if !root.has_tag_name("domain") {
            return Err(MoveError::Xml(format!(
                "expected <domain>, found <{}>",
                root.tag_name().name()
            )));
        }

        let name = child_text(root, "name")
            .ok_or_else(|| MoveError::Xml("domain has no <name>".to_string()))?
            .to_string();

        let vcpus = match child(root, "vcpu") {
            Some(node) => parse_number::<u32>(node, "vcpu")?,
            None => 1,
        };

        let memory_bytes = match child(root, "memory") {
            Some(node) => {
                let amount = parse_number::<u64>(node, "memory")?;
                let unit = node.attribute("unit").unwrap_or("KiB");
                memory_to_bytes(amount, unit)?
            }
            None => 0,
        };

        let devices = child(root, "devices");

        let vnc_port = devices
            .and_then(|devices| {
                devices
                    .children()
                    .find(|n| n.has_tag_name("graphics") && n.attribute("type") == Some("vnc"))
            })
            .and_then(|graphics| graphics.attribute("port"))
            .and_then(|port| port.parse::<i32>().ok())
            .and_then(|port| u16::try_from(port).ok());

        let disks = devices
            .map(|devices| {
                devices
                    .children()
                    .filter(|n| n.has_tag_name("disk"))
                    .filter_map(|disk| disk_source(&name, disk))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name,
            vcpus,
            memory_bytes,
            vnc_port,
            disks,
        })
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
    child(node, tag).and_then(|n| n.text()).map(str::trim)
}

fn parse_number<T: std::str::FromStr>(node: Node<'_, '_>, tag: &str) -> Result<T> {
    let text = node.text().map(str::trim).unwrap_or_default();
    text.parse::<T>()
        .map_err(|_| MoveError::Xml(format!("<{}> is not a number: '{}'", tag, text)))
}

fn disk_source(guest: &str, disk: Node<'_, '_>) -> Option<DiskSource> {
    if disk.attribute("device").is_some_and(|device| device != "disk") {
        return None;
    }

    let source = child(disk, "source");
    match disk.attribute("type") {
        Some("block") => source
            .and_then(|s| s.attribute("dev"))
            .map(|dev| DiskSource {
                path: dev.to_string(),
                backend: DiskBackend::LogicalVolume,
            }),
        Some("file") => {
            let format = child(disk, "driver").and_then(|d| d.attribute("type"));
            let file = source.and_then(|s| s.attribute("file"))?;
            if format == Some("qcow2") {
                Some(DiskSource {
                    path: file.to_string(),
                    backend: DiskBackend::CopyOnWrite,
                })
            } else {
                log_warn!(
                    "Skipping {} of guest '{}': format {:?} is not migratable",
                    file,
                    guest,
                    format
                );
                None
            }
        }
        other => {
            log_warn!(
                "Skipping disk of type {:?} on guest '{}'",
                other.unwrap_or("unknown"),
                guest
            );
            None
        }
    }
}

/// Convert a libvirt scaled integer to bytes.
pub fn memory_to_bytes(amount: u64, unit: &str) -> Result<u64> {
    let factor: u64 = match unit {
        "b" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "TB" => 1_000_000_000_000,
        "T" | "TiB" => 1 << 40,
        other => return Err(MoveError::Xml(format!("unknown memory unit '{}'", other))),
    };
    amount
        .checked_mul(factor)
        .ok_or_else(|| MoveError::Xml(format!("memory {} {} overflows", amount, unit)))
}
