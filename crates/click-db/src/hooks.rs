use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use click_core::{
    app_id, manifest_path, short_app_id, split_app_id, validate_app_name, validate_package_name,
    validate_version, ClickError, Deb822Fields, IoResultExt, Manifest, ManifestHooks, Result,
};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::database::ClickDb;
use crate::fs_utils::{
    ensure_dir, force_symlink, force_unlink, list_dir_or_empty, read_link_if_exists,
};
use crate::privileges::{lookup_user, PrivilegeMode};
use crate::registry::{is_pseudo_user, UserRegistry, Users};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternPiece {
    Literal(String),
    Key(String),
}

fn parse_pattern(template: &str) -> Vec<PatternPiece> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut rest = template;
    while let Some(index) = rest.find('$') {
        literal.push_str(&rest[..index]);
        let after = &rest[index + 1..];
        if let Some(after) = after.strip_prefix('$') {
            literal.push('$');
            rest = after;
        } else if let Some((key, tail)) = after
            .strip_prefix('{')
            .and_then(|inner| inner.split_once('}'))
        {
            if !literal.is_empty() {
                pieces.push(PatternPiece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(PatternPiece::Key(key.to_string()));
            rest = tail;
        } else {
            literal.push('$');
            rest = after;
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        pieces.push(PatternPiece::Literal(literal));
    }
    pieces
}

/// Substitute `${key}` from `values` (unknown keys expand to nothing),
/// collapse `$$` to `$`, and strip trailing slashes.
pub fn expand_pattern(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut expanded = String::new();
    for piece in parse_pattern(template) {
        match piece {
            PatternPiece::Literal(text) => expanded.push_str(&text),
            PatternPiece::Key(key) => {
                if let Some(value) = values.get(key.as_str()) {
                    expanded.push_str(value);
                }
            }
        }
    }
    expanded.trim_end_matches('/').to_string()
}

/// If `candidate` could be an expansion of `template` with the `bound` keys
/// fixed, return the values the remaining keys took.
pub fn possible_expansion(
    candidate: &str,
    template: &str,
    bound: &BTreeMap<&str, String>,
) -> Option<BTreeMap<String, String>> {
    let mut source = String::from("^");
    let mut groups = Vec::new();
    for piece in parse_pattern(template) {
        match piece {
            PatternPiece::Literal(text) => source.push_str(&regex::escape(&text)),
            PatternPiece::Key(key) => match bound.get(key.as_str()) {
                Some(value) => source.push_str(&regex::escape(value)),
                None => {
                    source.push_str("(.*)");
                    groups.push(key);
                }
            },
        }
    }
    source.push('$');
    let regex = Regex::new(&source).ok()?;
    let captures = regex.captures(candidate)?;
    let mut found = BTreeMap::new();
    for (index, key) in groups.into_iter().enumerate() {
        let value = captures.get(index + 1).map_or("", |m| m.as_str());
        found.insert(key, value.to_string());
    }
    Some(found)
}

/// A `<hooks_dir>/<name>.hook` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    name: String,
    fields: Deb822Fields,
}

impl HookDescriptor {
    pub fn new(name: impl Into<String>, fields: Deb822Fields) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn open(db: &ClickDb, name: &str) -> Result<Self> {
        let path = db.config().hook_path(name);
        if !path.is_file() {
            return Err(ClickError::HookNotFound(name.to_string()));
        }
        Ok(Self::new(name, Deb822Fields::read(&path)?))
    }

    /// Every descriptor, sorted by file name, optionally only those serving
    /// `hook_name`. Unreadable files are skipped.
    pub fn open_all(db: &ClickDb, hook_name: Option<&str>) -> Result<Vec<Self>> {
        let hooks_dir = &db.config().hooks_dir;
        let mut hooks = Vec::new();
        for entry in list_dir_or_empty(hooks_dir)? {
            let Some(name) = entry.strip_suffix(".hook") else {
                continue;
            };
            let fields = match Deb822Fields::read(&hooks_dir.join(&entry)) {
                Ok(fields) => fields,
                Err(err) => {
                    warn!(hook = name, error = %err, "skipping unreadable hook");
                    continue;
                }
            };
            let hook = Self::new(name, fields);
            if hook_name.map_or(true, |wanted| hook.hook_name() == wanted) {
                hooks.push(hook);
            }
        }
        Ok(hooks)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_level(&self) -> bool {
        self.fields.flag("user-level")
    }

    pub fn single_version(&self) -> bool {
        self.user_level() || self.fields.flag("single-version")
    }

    /// Manifest hook name served; defaults to the descriptor's own name.
    pub fn hook_name(&self) -> &str {
        self.fields.get("hook-name").unwrap_or(&self.name)
    }

    pub fn exec(&self) -> Option<&str> {
        self.fields.get("exec")
    }

    fn pattern_template(&self) -> Result<&str> {
        self.fields.get("pattern").ok_or_else(|| ClickError::HookFailed {
            hook: self.name.clone(),
            reason: "no Pattern field".to_string(),
        })
    }

    /// User that `exec` runs as.
    fn command_user<'a>(&'a self, user: Option<&'a str>) -> Option<&'a str> {
        if self.user_level() {
            user
        } else {
            self.fields.get("user")
        }
    }

    fn user_values(&self, user: Option<&str>) -> Result<BTreeMap<&'static str, String>> {
        let mut values = BTreeMap::new();
        let Some(user) = user else {
            return Ok(values);
        };
        values.insert("user", user.to_string());
        if self.pattern_template()?.contains("${home}") {
            let home = lookup_user(user)?.home;
            values.insert("home", home.to_string_lossy().into_owned());
        }
        Ok(values)
    }

    /// Link path for one app of one package version.
    pub fn pattern(
        &self,
        package: &str,
        version: &str,
        app_name: &str,
        user: Option<&str>,
    ) -> Result<PathBuf> {
        let mut values = self.user_values(user)?;
        values.insert("id", app_id(package, version, app_name)?);
        if self.single_version() {
            values.insert("short-id", short_app_id(package, app_name)?);
        }
        Ok(PathBuf::from(expand_pattern(self.pattern_template()?, &values)))
    }

    fn link_dir(&self, user: Option<&str>) -> Result<PathBuf> {
        let mut values = self.user_values(user)?;
        values.insert("id", String::new());
        values.insert("short-id", String::new());
        let sample = PathBuf::from(expand_pattern(self.pattern_template()?, &values));
        Ok(sample.parent().map(Path::to_path_buf).unwrap_or_default())
    }

    /// Existing links that match the pattern, with the identity decoded
    /// from their `id`.
    fn previous_entries(&self, user: Option<&str>) -> Result<Vec<PreviousEntry>> {
        let template = self.pattern_template()?;
        let bound = self.user_values(user)?;
        let link_dir = self.link_dir(user)?;
        let mut entries = Vec::new();
        for entry in list_dir_or_empty(&link_dir)? {
            let path = link_dir.join(&entry);
            let Some(expansion) = possible_expansion(&path.to_string_lossy(), template, &bound)
            else {
                continue;
            };
            let Some((package, app_name, version)) =
                expansion.get("id").and_then(|id| split_app_id(id))
            else {
                continue;
            };
            entries.push(PreviousEntry {
                path: path.clone(),
                package: package.to_string(),
                version: version.to_string(),
                app_name: app_name.to_string(),
            });
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PreviousEntry {
    path: PathBuf,
    package: String,
    version: String,
    app_name: String,
}

/// One app of one package that declares a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevantApp {
    pub package: String,
    pub version: String,
    pub app_name: String,
    pub user: Option<String>,
    pub relative_path: String,
}

/// Projects manifest hook entries into the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct HookEngine<'db> {
    db: &'db ClickDb,
}

impl<'db> HookEngine<'db> {
    pub fn new(db: &'db ClickDb) -> Self {
        Self { db }
    }

    fn manifest_hooks(&self, package: &str, version: Option<&str>) -> ManifestHooks {
        let Some(version) = version else {
            return ManifestHooks::new();
        };
        let Ok(dir) = self.db.path(package, version) else {
            return ManifestHooks::new();
        };
        match Manifest::read_hooks(&manifest_path(&dir, package)) {
            Ok(hooks) => hooks,
            Err(err) => {
                debug!(package, version, error = %err, "treating manifest hooks as empty");
                ManifestHooks::new()
            }
        }
    }

    fn install_link(
        &self,
        hook: &HookDescriptor,
        app: &RelevantApp,
        registry: Option<&UserRegistry<'_>>,
    ) -> Result<()> {
        let target = match registry {
            Some(registry) => registry.path(&app.package)?.join(&app.relative_path),
            None => self
                .db
                .path(&app.package, &app.version)?
                .join(&app.relative_path),
        };
        let link = hook.pattern(&app.package, &app.version, &app.app_name, app.user.as_deref())?;
        if read_link_if_exists(&link)?.as_deref() == Some(target.as_path()) {
            return Ok(());
        }
        if let Some(parent) = link.parent() {
            ensure_dir(parent)?;
        }
        force_symlink(&target, &link)?;
        info!(hook = hook.name(), link = %link.display(), target = %target.display(), "installed hook link");
        Ok(())
    }

    fn run_commands(&self, hook: &HookDescriptor, user: Option<&str>) -> Result<()> {
        if let Some(exec) = hook.exec() {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(exec);
            if let Some(run_as) = hook.command_user(user) {
                if self.db.privilege_mode() == PrivilegeMode::Manage {
                    let account = lookup_user(run_as)?;
                    command
                        .uid(account.uid)
                        .gid(account.gid)
                        .env("HOME", &account.home);
                }
            }
            info!(hook = hook.name(), exec, "running hook command");
            let status = command.status().at_path("/bin/sh")?;
            if !status.success() {
                return Err(ClickError::HookFailed {
                    hook: hook.name().to_string(),
                    reason: format!("'{exec}' exited with {status}"),
                });
            }
        }
        if hook.fields.flag("trigger") {
            return Err(ClickError::HookFailed {
                hook: hook.name().to_string(),
                reason: "'Trigger: yes' is not supported".to_string(),
            });
        }
        Ok(())
    }

    /// Project one app's hook entry, removing links for other versions of
    /// the same app first when the hook keeps a single version.
    pub fn install_package(
        &self,
        hook: &HookDescriptor,
        package: &str,
        version: &str,
        app_name: &str,
        relative_path: &str,
        user: Option<&str>,
    ) -> Result<()> {
        validate_package_name(package)?;
        validate_version(version)?;
        validate_app_name(app_name)?;
        let registry = if hook.user_level() {
            Some(UserRegistry::new(self.db, user)?)
        } else {
            None
        };
        let user = registry.as_ref().map(|registry| registry.user());

        if hook.single_version() {
            for previous in hook.previous_entries(user)? {
                if previous.package == package
                    && previous.app_name == app_name
                    && previous.version != version
                {
                    force_unlink(&previous.path)?;
                }
            }
        }

        let app = RelevantApp {
            package: package.to_string(),
            version: version.to_string(),
            app_name: app_name.to_string(),
            user: user.map(str::to_string),
            relative_path: relative_path.to_string(),
        };
        match &registry {
            Some(registry) => {
                let _guard = registry.drop_privileges()?;
                self.install_link(hook, &app, Some(registry))?;
            }
            None => self.install_link(hook, &app, None)?,
        }
        self.run_commands(hook, user)
    }

    pub fn remove_package(
        &self,
        hook: &HookDescriptor,
        package: &str,
        version: &str,
        app_name: &str,
        user: Option<&str>,
    ) -> Result<()> {
        let link = hook.pattern(package, version, app_name, user)?;
        force_unlink(&link)?;
        debug!(hook = hook.name(), link = %link.display(), "removed hook link");
        self.run_commands(hook, user)
    }

    /// Apps declaring this hook. User-level hooks look at registrations
    /// (of `user`, or of every real user); system-level hooks at the
    /// current version of every installed package.
    pub fn relevant_apps(
        &self,
        hook: &HookDescriptor,
        user: Option<&str>,
    ) -> Result<Vec<RelevantApp>> {
        let mut selections = Vec::new();
        if hook.user_level() {
            let users = match user {
                Some(user) => vec![user.to_string()],
                None => Users::new(self.db)
                    .names()?
                    .into_iter()
                    .filter(|name| !is_pseudo_user(name))
                    .collect(),
            };
            for user in users {
                let registry = UserRegistry::new(self.db, Some(&user))?;
                for (package, version) in registry.versions()? {
                    selections.push((package, version, Some(user.clone())));
                }
            }
        } else {
            for installed in self.db.packages(false)? {
                selections.push((installed.package, installed.version, None));
            }
        }

        let mut apps = Vec::new();
        for (package, version, user) in selections {
            for (app_name, hooks) in self.manifest_hooks(&package, Some(&version)) {
                if let Some(relative_path) = hooks.get(hook.hook_name()) {
                    apps.push(RelevantApp {
                        package: package.clone(),
                        version: version.clone(),
                        app_name,
                        user: user.clone(),
                        relative_path: relative_path.clone(),
                    });
                }
            }
        }
        Ok(apps)
    }

    /// Install the hook for every relevant app.
    pub fn install_all(&self, hook: &HookDescriptor, user: Option<&str>) -> Result<()> {
        for app in self.relevant_apps(hook, user)? {
            self.install_package(
                hook,
                &app.package,
                &app.version,
                &app.app_name,
                &app.relative_path,
                app.user.as_deref(),
            )?;
        }
        Ok(())
    }

    pub fn remove_all(&self, hook: &HookDescriptor, user: Option<&str>) -> Result<()> {
        for app in self.relevant_apps(hook, user)? {
            self.remove_package(
                hook,
                &app.package,
                &app.version,
                &app.app_name,
                app.user.as_deref(),
            )?;
        }
        Ok(())
    }

    /// Make the hook's links match the relevant apps exactly, then run its
    /// command once.
    pub fn sync(&self, hook: &HookDescriptor, user: Option<&str>) -> Result<()> {
        let registry = if hook.user_level() {
            Some(UserRegistry::new(self.db, user)?)
        } else {
            None
        };
        let user = registry.as_ref().map(|registry| registry.user());

        let mut seen = BTreeSet::new();
        for app in self.relevant_apps(hook, user)? {
            seen.insert((app.package.clone(), app.version.clone(), app.app_name.clone()));
            match &registry {
                Some(registry) => {
                    let _guard = registry.drop_privileges()?;
                    self.install_link(hook, &app, Some(registry))?;
                }
                None => self.install_link(hook, &app, None)?,
            }
        }
        for previous in hook.previous_entries(user)? {
            let key = (previous.package, previous.version, previous.app_name);
            if !seen.contains(&key) {
                force_unlink(&previous.path)?;
                debug!(hook = hook.name(), link = %previous.path.display(), "removed stale hook link");
            }
        }
        self.run_commands(hook, user)
    }

    /// Re-project hooks after `package` moves from `old_version` to
    /// `new_version`. With a user only user-level hooks run, otherwise
    /// only system-level ones. Entries of the old manifest missing from the
    /// new one are removed; every entry of the new one is installed.
    pub fn run_install_hooks(
        &self,
        package: &str,
        old_version: Option<&str>,
        new_version: Option<&str>,
        user: Option<&str>,
    ) -> Result<()> {
        let old_hooks = self.manifest_hooks(package, old_version);
        let new_hooks = self.manifest_hooks(package, new_version);
        let user_level = user.is_some();

        if let Some(old_version) = old_version {
            let old_pairs = app_hook_pairs(&old_hooks);
            let new_pairs = app_hook_pairs(&new_hooks);
            for (app_name, hook_name) in old_pairs.difference(&new_pairs) {
                for hook in HookDescriptor::open_all(self.db, Some(hook_name.as_str()))? {
                    if hook.user_level() != user_level {
                        continue;
                    }
                    self.remove_package(&hook, package, old_version, app_name, user)?;
                }
            }
        }

        let Some(new_version) = new_version else {
            return Ok(());
        };
        for (app_name, hooks) in &new_hooks {
            for (hook_name, relative_path) in hooks {
                for hook in HookDescriptor::open_all(self.db, Some(hook_name.as_str()))? {
                    if hook.user_level() != user_level {
                        continue;
                    }
                    self.install_package(&hook, package, new_version, app_name, relative_path, user)?;
                }
            }
        }
        Ok(())
    }

    pub fn run_remove_hooks(
        &self,
        package: &str,
        old_version: &str,
        user: Option<&str>,
    ) -> Result<()> {
        self.run_install_hooks(package, Some(old_version), None, user)
    }

    /// Sync every system-level hook, for example after booting an image
    /// with preinstalled packages.
    pub fn run_system_hooks(&self) -> Result<()> {
        self.db.ensure_ownership()?;
        for hook in HookDescriptor::open_all(self.db, None)? {
            if !hook.user_level() {
                self.sync(&hook, None)?;
            }
        }
        Ok(())
    }

    pub fn run_user_hooks(&self, user: Option<&str>) -> Result<()> {
        for hook in HookDescriptor::open_all(self.db, None)? {
            if hook.user_level() {
                self.sync(&hook, user)?;
            }
        }
        Ok(())
    }
}

fn app_hook_pairs(hooks: &ManifestHooks) -> BTreeSet<(String, String)> {
    hooks
        .iter()
        .flat_map(|(app_name, hooks)| {
            hooks
                .keys()
                .map(move |hook_name| (app_name.clone(), hook_name.clone()))
        })
        .collect()
}
