use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use click_core::ClickConfig;
use click_db::{ClickDb, HookDescriptor, HookEngine, RemovalOutcome, UserRegistry, Users};
use click_installer::{
    list_frameworks, ClickInstaller, DpkgUnpacker, RegistrationTarget, Unpacker,
};
use serde_json::Value;
use tracing::debug;

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_gc_lines, format_package_lines, render_json,
    render_status_line, strip_dynamic, OutputStyle,
};
use crate::{Cli, Commands, HookCommands, UserTarget};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let config = ClickConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Commands::ListFrameworks = cli.command {
        for framework in list_frameworks(&config)? {
            println!("{}", framework.name);
        }
        return Ok(());
    }

    let db = open_database(config, cli.root)?;
    let style = current_output_style();
    let lines = match cli.command {
        Commands::Install {
            archive,
            target,
            force_missing_framework,
        } => install_package(&db, style, &archive, &target, force_missing_framework)?,
        Commands::Register {
            package,
            version,
            target,
        } => {
            registry_for(&db, &target)?
                .set_version(&package, &version)
                .with_context(|| format!("failed to register {package} {version}"))?;
            Vec::new()
        }
        Commands::Unregister {
            package,
            version,
            target,
        } => unregister_package(&db, style, &package, version.as_deref(), &target)?,
        Commands::List { all, user, manifest } => {
            list_packages(&db, all, user.as_deref(), manifest)?
        }
        Commands::Info { package, user } => vec![package_info(&db, &package, user.as_deref())?],
        Commands::Pkgdir { package, user } => {
            vec![package_dir(&db, &package, user.as_deref())?
                .display()
                .to_string()]
        }
        Commands::Gc => {
            let entries = db.gc(&Users::new(&db))?;
            format_gc_lines(style, &entries)
        }
        Commands::Hook(command) => {
            run_hook_command(&db, command)?;
            Vec::new()
        }
        Commands::ListFrameworks | Commands::Completions { .. } => Vec::new(),
    };

    for line in lines {
        println!("{line}");
    }
    Ok(())
}

/// Layers from the config directory, plus `--root` on top. With neither,
/// the default root is the only layer.
pub(crate) fn open_database(config: ClickConfig, root: Option<PathBuf>) -> Result<ClickDb> {
    let mut db = ClickDb::read(config).context("failed to read click databases")?;
    match root {
        Some(root) => db.add(root),
        None if db.is_empty() => {
            let default_root = db.config().default_root.clone();
            db.add(default_root);
        }
        None => {}
    }
    debug!(layers = db.len(), "opened click database");
    Ok(db)
}

fn registry_for<'db>(db: &'db ClickDb, target: &UserTarget) -> Result<UserRegistry<'db>> {
    if target.all_users {
        return Ok(UserRegistry::all_users(db));
    }
    Ok(UserRegistry::new(db, target.user.as_deref())?)
}

fn registration_target(target: &UserTarget) -> RegistrationTarget {
    if target.all_users {
        RegistrationTarget::AllUsers
    } else if let Some(user) = &target.user {
        RegistrationTarget::User(user.clone())
    } else {
        RegistrationTarget::Nobody
    }
}

pub(crate) fn install_package(
    db: &ClickDb,
    style: OutputStyle,
    archive: &Path,
    target: &UserTarget,
    force_missing_framework: bool,
) -> Result<Vec<String>> {
    install_with(
        ClickInstaller::new(db).force_missing_framework(force_missing_framework),
        style,
        archive,
        target,
    )
}

pub(crate) fn install_with(
    installer: ClickInstaller<'_>,
    style: OutputStyle,
    archive: &Path,
    target: &UserTarget,
) -> Result<Vec<String>> {
    let outcome = installer
        .install(archive, &registration_target(target))
        .with_context(|| format!("failed to install {}", archive.display()))?;
    let mut lines = vec![render_status_line(
        style,
        "installed",
        &format!("{} {}", outcome.package, outcome.version),
    )];
    if let (Some(old_version), Some(superseded)) = (&outcome.old_version, outcome.superseded) {
        let status = match superseded {
            RemovalOutcome::Removed => "removed",
            RemovalOutcome::InUse => "in-use",
            RemovalOutcome::Registered | RemovalOutcome::Absent => "kept",
        };
        lines.push(render_status_line(
            style,
            status,
            &format!("{} {old_version}", outcome.package),
        ));
    }
    Ok(lines)
}

pub(crate) fn unregister_package(
    db: &ClickDb,
    style: OutputStyle,
    package: &str,
    expected_version: Option<&str>,
    target: &UserTarget,
) -> Result<Vec<String>> {
    let target = UserTarget {
        user: target
            .user
            .clone()
            .or_else(|| std::env::var("SUDO_USER").ok()),
        all_users: target.all_users,
    };
    let registry = registry_for(db, &target)?;
    let old_version = registry.get_version(package)?;
    if let Some(expected) = expected_version {
        if expected != old_version {
            bail!("Not removing {package} {old_version}; expected version {expected}");
        }
    }
    registry.remove(package)?;
    let mut lines = vec![render_status_line(
        style,
        "unregistered",
        &format!("{package} {old_version} for {}", registry.user()),
    )];
    let outcome = db.maybe_remove(&Users::new(db), package, &old_version)?;
    if outcome == RemovalOutcome::Removed {
        lines.push(render_status_line(
            style,
            "removed",
            &format!("{package} {old_version}"),
        ));
    }
    Ok(lines)
}

pub(crate) fn list_packages(
    db: &ClickDb,
    all: bool,
    user: Option<&str>,
    manifest: bool,
) -> Result<Vec<String>> {
    if all {
        let installed = db.packages(true)?;
        if manifest {
            let manifests = installed
                .iter()
                .map(|package| db.manifest_report(&package.package, &package.version))
                .collect::<click_core::Result<Vec<_>>>()?;
            return Ok(vec![render_json(&Value::Array(manifests))?]);
        }
        return Ok(format_package_lines(
            installed
                .iter()
                .map(|package| (package.package.as_str(), package.version.as_str())),
        ));
    }

    let registry = UserRegistry::new(db, user)?;
    if manifest {
        return Ok(vec![render_json(&Value::Array(registry.manifests()?))?]);
    }
    let versions = registry.versions()?;
    Ok(format_package_lines(
        versions
            .iter()
            .map(|(package, version)| (package.as_str(), version.as_str())),
    ))
}

/// A registered package's manifest, or failing that the manifest inside
/// the archive at `package`.
pub(crate) fn package_info(db: &ClickDb, package: &str, user: Option<&str>) -> Result<String> {
    if !package.contains('/') {
        let registry = UserRegistry::new(db, user)?;
        if registry.has_package_name(package)? {
            return render_json(&strip_dynamic(registry.manifest(package)?));
        }
    }
    let manifest = DpkgUnpacker
        .inspect(Path::new(package))
        .with_context(|| format!("failed to read manifest of {package}"))?;
    render_json(&Value::Object(manifest.to_json_object()))
}

/// The registered directory of `package`, or for a path, the package
/// directory containing it.
pub(crate) fn package_dir(db: &ClickDb, package: &str, user: Option<&str>) -> Result<PathBuf> {
    if package.contains('/') {
        let path = Path::new(package)
            .canonicalize()
            .with_context(|| format!("failed to resolve {package}"))?;
        for ancestor in path.ancestors() {
            if ancestor.join(".click").join("info").is_dir() {
                return Ok(ancestor.to_path_buf());
            }
        }
        bail!("No package directory found for {package}");
    }
    Ok(UserRegistry::new(db, user)?.path(package)?)
}

pub(crate) fn run_hook_command(db: &ClickDb, command: HookCommands) -> Result<()> {
    let engine = HookEngine::new(db);
    match command {
        HookCommands::Install { name, user } => {
            let hook = HookDescriptor::open(db, &name)?;
            engine.install_all(&hook, user.as_deref())?;
        }
        HookCommands::Remove { name, user } => {
            let hook = HookDescriptor::open(db, &name)?;
            engine.remove_all(&hook, user.as_deref())?;
        }
        HookCommands::RunSystem => engine.run_system_hooks()?,
        HookCommands::RunUser { user } => engine.run_user_hooks(user.as_deref())?,
    }
    Ok(())
}
