//! Disk and container format validation

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// Encoding of the virtual disk image bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Amazon kernel image
    Aki,
    /// Amazon ramdisk image
    Ari,
    /// Amazon machine image
    Ami,
    /// Unstructured disk image
    Raw,
    /// Virtual Hard Disk
    Vhd,
    /// VMware Virtual Machine Disk
    Vmdk,
    /// VirtualBox Disk Image
    Vdi,
    /// Optical disc image
    Iso,
    /// QEMU copy-on-write v2
    Qcow2,
}

/// Packaging wrapper around the disk image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// Amazon kernel image
    Aki,
    /// Amazon ramdisk image
    Ari,
    /// Amazon machine image
    Ami,
    /// No container around the disk image
    Bare,
    /// Open Virtualization Format
    Ovf,
}

/// Which of the two formats a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatField {
    /// The disk format
    Disk,
    /// The container format
    Container,
}

impl fmt::Display for FormatField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatField::Disk => f.write_str("disk"),
            FormatField::Container => f.write_str("container"),
        }
    }
}

impl DiskFormat {
    /// The wire name of this format
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Aki => "aki",
            DiskFormat::Ari => "ari",
            DiskFormat::Ami => "ami",
            DiskFormat::Raw => "raw",
            DiskFormat::Vhd => "vhd",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Iso => "iso",
            DiskFormat::Qcow2 => "qcow2",
        }
    }

    fn is_amazon(&self) -> bool {
        matches!(self, DiskFormat::Aki | DiskFormat::Ari | DiskFormat::Ami)
    }
}

impl ContainerFormat {
    /// The wire name of this format
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Aki => "aki",
            ContainerFormat::Ari => "ari",
            ContainerFormat::Ami => "ami",
            ContainerFormat::Bare => "bare",
            ContainerFormat::Ovf => "ovf",
        }
    }

    fn is_amazon(&self) -> bool {
        matches!(
            self,
            ContainerFormat::Aki | ContainerFormat::Ari | ContainerFormat::Ami
        )
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "aki" => DiskFormat::Aki,
            "ari" => DiskFormat::Ari,
            "ami" => DiskFormat::Ami,
            "raw" => DiskFormat::Raw,
            "vhd" => DiskFormat::Vhd,
            "vmdk" => DiskFormat::Vmdk,
            "vdi" => DiskFormat::Vdi,
            "iso" => DiskFormat::Iso,
            "qcow2" => DiskFormat::Qcow2,
            _ => {
                return Err(RegistryError::InvalidFormat {
                    field: FormatField::Disk,
                    value: s.to_owned(),
                });
            }
        })
    }
}

impl FromStr for ContainerFormat {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "aki" => ContainerFormat::Aki,
            "ari" => ContainerFormat::Ari,
            "ami" => ContainerFormat::Ami,
            "bare" => ContainerFormat::Bare,
            "ovf" => ContainerFormat::Ovf,
            _ => {
                return Err(RegistryError::InvalidFormat {
                    field: FormatField::Container,
                    value: s.to_owned(),
                });
            }
        })
    }
}

/// Check that a parsed pair of formats may be combined.
///
/// Kernel, ramdisk and machine images are their own container: if either
/// side is `aki`, `ari` or `ami` and both are set, they must name the same
/// format.
pub fn check_compatible(
    disk_format: Option<DiskFormat>,
    container_format: Option<ContainerFormat>,
) -> RegistryResult<()> {
    let (Some(disk), Some(container)) = (disk_format, container_format) else {
        return Ok(());
    };

    if (disk.is_amazon() || container.is_amazon()) && disk.as_str() != container.as_str() {
        return Err(RegistryError::IncompatibleFormats {
            disk_format: disk.to_string(),
            container_format: container.to_string(),
        });
    }

    Ok(())
}

/// Validate a disk and container format pair as submitted by a client.
///
/// Unset values are always valid. Each set value must be a known format, and
/// the pair must pass [`check_compatible`].
pub fn validate(
    disk_format: Option<&str>,
    container_format: Option<&str>,
) -> RegistryResult<(Option<DiskFormat>, Option<ContainerFormat>)> {
    let disk = disk_format.map(str::parse::<DiskFormat>).transpose()?;
    let container = container_format
        .map(str::parse::<ContainerFormat>)
        .transpose()?;
    check_compatible(disk, container)?;
    Ok((disk, container))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISK: [&str; 9] = [
        "aki", "ari", "ami", "raw", "vhd", "vmdk", "vdi", "iso", "qcow2",
    ];
    const CONTAINER: [&str; 5] = ["aki", "ari", "ami", "bare", "ovf"];

    #[test]
    fn unset_formats_are_valid() {
        assert_eq!(validate(None, None).unwrap(), (None, None));
        assert_eq!(
            validate(Some("aki"), None).unwrap(),
            (Some(DiskFormat::Aki), None)
        );
        assert_eq!(
            validate(None, Some("ari")).unwrap(),
            (None, Some(ContainerFormat::Ari))
        );
    }

    #[test]
    fn unknown_values_name_their_field() {
        match validate(Some("invalid"), Some("ovf")) {
            Err(RegistryError::InvalidFormat { field, value }) => {
                assert_eq!(field, FormatField::Disk);
                assert_eq!(value, "invalid");
            }
            other => panic!("unexpected: {other:?}"),
        }

        match validate(Some("vhd"), Some("invalid")) {
            Err(RegistryError::InvalidFormat { field, .. }) => {
                assert_eq!(field, FormatField::Container)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn amazon_formats_must_match() {
        assert!(matches!(
            validate(Some("ari"), Some("aki")),
            Err(RegistryError::IncompatibleFormats { .. })
        ));
        assert!(matches!(
            validate(Some("vhd"), Some("ari")),
            Err(RegistryError::IncompatibleFormats { .. })
        ));
        assert!(matches!(
            validate(Some("aki"), Some("ovf")),
            Err(RegistryError::IncompatibleFormats { .. })
        ));
        assert!(validate(Some("aki"), Some("aki")).is_ok());
    }

    #[test]
    fn compatibility_table() {
        for disk in DISK {
            for container in CONTAINER {
                let amazon = |f: &str| matches!(f, "aki" | "ari" | "ami");
                let allowed = !(amazon(disk) || amazon(container)) || disk == container;
                let result = validate(Some(disk), Some(container));
                assert_eq!(result.is_ok(), allowed, "{disk}/{container}");
                if !allowed {
                    assert!(matches!(
                        result,
                        Err(RegistryError::IncompatibleFormats { .. })
                    ));
                }
            }
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for disk in DISK {
            assert_eq!(disk.parse::<DiskFormat>().unwrap().to_string(), disk);
        }
        for container in CONTAINER {
            assert_eq!(
                container.parse::<ContainerFormat>().unwrap().to_string(),
                container
            );
        }
    }
}
