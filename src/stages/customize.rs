//! Customize: identity, accounts, branding, service units.
//!
//! Content comes from the operator's inputs. This stage only decides where
//! each piece lands and in which order.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::build::context::BuildContext;
use crate::build::filesystem::copy_tree;
use crate::build::stage::{BuildState, Stage};
use crate::config::{Account, IdentitySection};
use crate::error::PreconditionError;
use crate::executor::{resolve_in_root, Operation};

pub const NAME: &str = "customize";

const UNIT_SUFFIXES: &[&str] = &[".service", ".timer"];

pub fn stage() -> Stage {
    Stage::new(NAME, BuildState::Customized, run)
}

fn run(ctx: &mut BuildContext) -> Result<()> {
    apply_identity(ctx)?;
    let accounts = ctx.config.accounts.clone();
    for account in &accounts {
        provision_account(ctx, account)?;
    }
    if let Some(dir) = ctx.config.inputs.branding_dir.clone() {
        apply_branding(ctx, &dir)?;
    }
    if let Some(dir) = ctx.config.inputs.service_units_dir.clone() {
        install_service_units(ctx, &dir)?;
    }
    Ok(())
}

fn write_in_root(root: &Path, relative: &str, content: &str) -> Result<()> {
    let path = resolve_in_root(root, relative)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Character set named by a locale such as `en_US.UTF-8`.
fn locale_charset(locale: &str) -> &str {
    locale.split_once('.').map_or("UTF-8", |(_, charset)| charset)
}

fn apply_identity(ctx: &BuildContext) -> Result<()> {
    let root = ctx.target_root();
    let IdentitySection {
        hostname,
        locale,
        timezone,
    } = &ctx.config.identity;

    write_in_root(root, "etc/hostname", &format!("{}\n", hostname))?;
    write_in_root(
        root,
        "etc/hosts",
        &format!(
            "127.0.0.1\tlocalhost\n127.0.1.1\t{}\n::1\t\tlocalhost ip6-localhost ip6-loopback\n",
            hostname
        ),
    )?;

    write_in_root(
        root,
        "etc/locale.gen",
        &format!("{} {}\n", locale, locale_charset(locale)),
    )?;
    ctx.exec(&Operation::in_chroot(root, "locale-gen"))
        .with_context(|| format!("Failed to generate locale {}", locale))?;
    write_in_root(root, "etc/default/locale", &format!("LANG={}\n", locale))?;

    // Validates the zone name even though the link target is absolute.
    resolve_in_root(root, &format!("usr/share/zoneinfo/{}", timezone))?;
    write_in_root(root, "etc/timezone", &format!("{}\n", timezone))?;
    let localtime = resolve_in_root(root, "etc/localtime")?;
    if localtime.exists() || localtime.is_symlink() {
        fs::remove_file(&localtime)
            .with_context(|| format!("Failed to replace {}", localtime.display()))?;
    }
    std::os::unix::fs::symlink(format!("/usr/share/zoneinfo/{}", timezone), &localtime)
        .with_context(|| format!("Failed to link {}", localtime.display()))?;

    info!(hostname = %hostname, locale = %locale, timezone = %timezone, "identity applied");
    Ok(())
}

/// Read a UID from the target root's passwd file.
///
/// Returns `Ok(None)` when the user (or the file) does not exist.
pub fn read_uid_from_root(root: &Path, username: &str) -> Result<Option<u32>> {
    let passwd = root.join("etc/passwd");
    if !passwd.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&passwd)
        .with_context(|| format!("Failed to read passwd file at {}", passwd.display()))?;
    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == username {
            let uid = parts[2].parse().with_context(|| {
                format!(
                    "Corrupted passwd file: invalid UID '{}' for user '{}' at {}",
                    parts[2],
                    username,
                    passwd.display()
                )
            })?;
            return Ok(Some(uid));
        }
    }
    Ok(None)
}

fn provision_account(ctx: &BuildContext, account: &Account) -> Result<()> {
    let root = ctx.target_root();
    if let Some(uid) = read_uid_from_root(root, &account.name)? {
        info!(user = %account.name, uid, "account already exists; skipping");
        return Ok(());
    }

    let uid = account.uid.to_string();
    let mut op = Operation::in_chroot(root, "useradd")
        .args(["-m", "-u", uid.as_str(), "-s", account.shell.as_str()]);
    if !account.groups.is_empty() {
        op = op.args(["-G".to_string(), account.groups.join(",")]);
    }
    ctx.exec(&op.arg(account.name.as_str()))
        .with_context(|| format!("Failed to create account {}", account.name))?;
    Ok(())
}

fn require_dir(dir: &Path, what: &'static str) -> Result<()> {
    if !dir.is_dir() {
        return Err(PreconditionError::MissingInput {
            what,
            path: dir.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

fn apply_branding(ctx: &BuildContext, dir: &Path) -> Result<()> {
    require_dir(dir, "branding directory")?;
    let copied = copy_tree(dir, ctx.target_root())
        .with_context(|| format!("Failed to apply branding from {}", dir.display()))?;
    info!(files = copied, source = %dir.display(), "branding applied");
    Ok(())
}

fn install_service_units(ctx: &BuildContext, dir: &Path) -> Result<()> {
    require_dir(dir, "service units directory")?;
    let mut units = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && UNIT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            units.push((name.to_string(), path.clone()));
        }
    }
    units.sort();

    let root = ctx.target_root();
    for (name, source) in &units {
        let target = resolve_in_root(root, &format!("etc/systemd/system/{}", name))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &target)
            .with_context(|| format!("Failed to install unit {}", source.display()))?;
        ctx.exec(&Operation::in_chroot(root, "systemctl").args(["enable", name.as_str()]))
            .with_context(|| format!("Failed to enable unit {}", name))?;
    }
    Ok(())
}
