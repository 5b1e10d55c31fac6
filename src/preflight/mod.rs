//! Preflight checks.
//!
//! Validates that the host has the tools a command needs before any work
//! starts, so a missing `mksquashfs` is reported up front instead of after a
//! long package build.

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::manifest::{Manifest, SourceDescriptor};
use crate::process;

/// A host tool and the distribution package that usually provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub command: Cow<'static, str>,
    pub package: &'static str,
}

const fn tool(command: &'static str, package: &'static str) -> Tool {
    Tool {
        command: Cow::Borrowed(command),
        package,
    }
}

pub const GIT: Tool = tool("git", "git");
pub const MKSQUASHFS: Tool = tool("mksquashfs", "squashfs-tools");
pub const QEMU: Tool = tool("qemu-system-x86_64", "qemu");
pub const QEMU_IMG: Tool = tool("qemu-img", "qemu");

/// The container runtime named in config.
pub fn container_runtime(runtime: &str) -> Tool {
    let package = match runtime {
        "podman" => "podman",
        _ => "docker",
    };
    Tool {
        command: Cow::Owned(runtime.to_string()),
        package,
    }
}

/// Operations with distinct host requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Fetch,
    Build,
    Assemble,
    Kernel,
    Initrd,
    Gc,
    VmRun,
    VmReset,
}

/// Tools `op` needs for `manifest`.
pub fn required_tools(op: Operation, runtime: &str, manifest: &Manifest) -> Vec<Tool> {
    let uses_git = manifest
        .packages
        .iter()
        .any(|p| matches!(p.source, SourceDescriptor::Git { .. }));
    let mut tools = Vec::new();
    if uses_git && matches!(op, Operation::Fetch | Operation::Build | Operation::Assemble | Operation::Gc) {
        tools.push(GIT);
    }
    match op {
        Operation::Build | Operation::Kernel => tools.push(container_runtime(runtime)),
        Operation::Assemble => {
            tools.push(container_runtime(runtime));
            tools.push(MKSQUASHFS);
        }
        Operation::VmRun => {
            tools.push(QEMU);
            tools.push(QEMU_IMG);
        }
        Operation::VmReset => tools.push(QEMU_IMG),
        Operation::Fetch | Operation::Initrd | Operation::Gc => {}
    }
    tools
}

/// Tools missing from `PATH`.
pub fn missing_tools(tools: &[Tool]) -> Vec<Tool> {
    tools
        .iter()
        .filter(|t| !process::exists(&t.command))
        .cloned()
        .collect()
}

/// Check that every tool is available, listing all missing ones.
pub fn check_required_tools(tools: &[Tool]) -> Result<()> {
    let missing = missing_tools(tools);
    if missing.is_empty() {
        return Ok(());
    }
    let list = missing
        .iter()
        .map(|t| format!("{} (install: {})", t.command, t.package))
        .collect::<Vec<_>>()
        .join(", ");
    Err(Error::not_found("required host tools", list))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_is_required_only_for_git_sources() {
        let local = Manifest::parse(
            "version = \"1\"\n[[package]]\nname = \"a\"\nversion = \"1\"\nsource = { kind = \"pkgbuild\", local_path = \"a\" }\n",
            std::path::Path::new("/p"),
        )
        .unwrap();
        let remote = Manifest::parse(
            "version = \"1\"\n[[package]]\nname = \"a\"\nversion = \"1\"\nsource = { kind = \"git\", repo_url = \"https://example.org/a.git\", rev = \"main\" }\n",
            std::path::Path::new("/p"),
        )
        .unwrap();

        assert!(!required_tools(Operation::Fetch, "docker", &local).contains(&GIT));
        assert!(required_tools(Operation::Fetch, "docker", &remote).contains(&GIT));
        assert!(!required_tools(Operation::VmRun, "docker", &remote).contains(&GIT));
    }

    #[test]
    fn assembly_needs_runtime_and_mksquashfs() {
        let manifest = Manifest::parse("version = \"1\"\n", std::path::Path::new("/p")).unwrap();
        let tools = required_tools(Operation::Assemble, "podman", &manifest);
        assert_eq!(tools, [container_runtime("podman"), MKSQUASHFS]);
        assert_eq!(tools[0].package, "podman");
    }

    #[test]
    fn present_tools_pass() {
        assert!(check_required_tools(&[tool("sh", "coreutils"), tool("ls", "coreutils")]).is_ok());
    }

    #[test]
    fn every_missing_tool_is_listed() {
        let tools = [
            tool("sh", "coreutils"),
            tool("nonexistent_command_xyz", "fake-package"),
            tool("nonexistent_command_abc", "other-package"),
        ];
        let missing = missing_tools(&tools);
        assert_eq!(missing.len(), 2);

        let msg = check_required_tools(&tools).unwrap_err().to_string();
        assert!(msg.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(msg.contains("nonexistent_command_abc (install: other-package)"));
    }
}
