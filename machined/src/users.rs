//! Per-user environments (fsroot and resource path) and the account
//! database they are resolved against.

use crate::config::{parse_user_file, GlobalUserEntry, USER_CONFIG_FILE};
use crate::wire::{CoreDump, UserMessage};
use nix::unistd::{Uid, User};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, info};

/// Most core files reported per user query.
pub const MAX_COREDUMPS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserEnv {
    pub uid: u16,
    pub gid: u32,
    pub username: String,
    pub full_name: String,
    pub home: String,
    pub fsroot: String,
    pub respath: String,
}

impl UserEnv {
    /// Whether a usable environment was configured for this user.
    pub fn has_env(&self) -> bool {
        !self.fsroot.is_empty()
    }

    pub fn to_message(&self, param: u8) -> UserMessage {
        UserMessage {
            param,
            uid: self.uid,
            username: self.username.clone(),
            full_name: self.full_name.clone(),
            home: self.home.clone(),
            fsroot: self.fsroot.clone(),
            respath: self.respath.clone(),
            coredumps: Vec::new(),
        }
    }
}

/// An entry from the system account database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub full_name: String,
    pub home: String,
}

pub trait AccountLookup {
    fn by_uid(&self, uid: u32) -> Option<Account>;
    fn by_name(&self, name: &str) -> Option<Account>;
    fn all(&self) -> Vec<Account>;
}

/// getpwuid/getpwnam, plus a scan of /etc/passwd for enumeration.
#[derive(Debug, Default)]
pub struct SystemAccounts;

impl SystemAccounts {
    fn from_user(u: User) -> Account {
        let gecos = u.gecos.to_string_lossy();
        Account {
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
            name: u.name,
            // gecos is "full name,room,phone,..."
            full_name: gecos.split(',').next().unwrap_or("").to_string(),
            home: u.dir.to_string_lossy().into_owned(),
        }
    }
}

impl AccountLookup for SystemAccounts {
    fn by_uid(&self, uid: u32) -> Option<Account> {
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(Self::from_user)
    }

    fn by_name(&self, name: &str) -> Option<Account> {
        User::from_name(name).ok().flatten().map(Self::from_user)
    }

    fn all(&self) -> Vec<Account> {
        match fs::read_to_string("/etc/passwd") {
            Ok(s) => parse_passwd(&s),
            Err(e) => {
                debug!(error = %e, "reading /etc/passwd");
                Vec::new()
            }
        }
    }
}

/// `name:passwd:uid:gid:gecos:home:shell` lines.
pub fn parse_passwd(s: &str) -> Vec<Account> {
    s.lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| {
            let f: Vec<&str> = l.split(':').collect();
            if f.len() < 6 {
                return None;
            }
            Some(Account {
                name: f[0].to_string(),
                uid: f[2].parse().ok()?,
                gid: f[3].parse().ok()?,
                full_name: f[4].split(',').next().unwrap_or("").to_string(),
                home: f[5].to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct UserEnvironmentCache {
    users: BTreeMap<u16, UserEnv>,
    global: Vec<GlobalUserEntry>,
}

impl UserEnvironmentCache {
    pub fn new(global: Vec<GlobalUserEntry>) -> Self {
        Self {
            users: BTreeMap::new(),
            global,
        }
    }

    pub fn set_global_table(&mut self, global: Vec<GlobalUserEntry>) {
        self.global = global;
    }

    pub fn get(&self, uid: u16) -> Option<&UserEnv> {
        self.users.get(&uid)
    }

    pub fn all(&self) -> impl Iterator<Item = &UserEnv> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn flush(&mut self) {
        self.users.clear();
    }

    /// Cached entry, or a fresh lookup in the account database.
    pub fn lookup_uid(&mut self, uid: u16, accounts: &dyn AccountLookup) -> Option<&UserEnv> {
        if !self.users.contains_key(&uid) {
            self.refresh(uid, accounts)?;
        }
        self.users.get(&uid)
    }

    pub fn lookup_name(&mut self, name: &str, accounts: &dyn AccountLookup) -> Option<&UserEnv> {
        let cached = self.users.values().find(|u| u.username == name).map(|u| u.uid);
        let uid = match cached {
            Some(uid) => uid,
            None => {
                let account = accounts.by_name(name)?;
                let uid = u16::try_from(account.uid).ok()?;
                self.insert(account, uid);
                uid
            }
        };
        self.users.get(&uid)
    }

    /// Re-resolve one user from the account database and config files.
    pub fn refresh(&mut self, uid: u16, accounts: &dyn AccountLookup) -> Option<&UserEnv> {
        let account = accounts.by_uid(uid as u32)?;
        Some(self.insert(account, uid))
    }

    /// Drop everything and eagerly load every account with a configured environment.
    pub fn refresh_all(&mut self, accounts: &dyn AccountLookup) {
        self.users.clear();
        for account in accounts.all() {
            let Ok(uid) = u16::try_from(account.uid) else {
                continue;
            };
            let env = self.resolve(account, uid);
            if env.has_env() {
                self.users.insert(uid, env);
            }
        }
        info!(users = self.users.len(), "loaded user environments");
    }

    fn insert(&mut self, account: Account, uid: u16) -> &UserEnv {
        let env = self.resolve(account, uid);
        self.users.insert(uid, env);
        &self.users[&uid]
    }

    // per-user file first, then the global table
    fn resolve(&self, account: Account, uid: u16) -> UserEnv {
        let mut env = UserEnv {
            uid,
            gid: account.gid,
            username: account.name,
            full_name: account.full_name,
            home: account.home,
            ..Default::default()
        };
        let user_file = Path::new(&env.home).join(USER_CONFIG_FILE);
        let from_file = fs::read_to_string(&user_file)
            .ok()
            .and_then(|s| parse_user_file(&s));
        if let Some((fsroot, respath)) = from_file {
            env.fsroot = fsroot;
            env.respath = respath;
        } else if let Some(g) = self.global.iter().find(|g| g.matches(uid, &env.username)) {
            env.fsroot = g.fsroot.clone();
            env.respath = g.respath.clone();
        }
        env
    }
}

/// Recent core files under `fsroot/bin/*/`, each with the matching assert log.
pub fn scan_coredumps(fsroot: &str) -> Vec<CoreDump> {
    let mut found = Vec::new();
    let Ok(dirs) = fs::read_dir(Path::new(fsroot).join("bin")) else {
        return found;
    };
    for dir in dirs.flatten() {
        let dir = dir.path();
        let Ok(files) = fs::read_dir(&dir) else {
            continue;
        };
        for f in files.flatten() {
            let name = f.file_name();
            let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix("core.")) else {
                continue;
            };
            let Ok(meta) = f.metadata() else { continue };
            let assert_log =
                fs::read_to_string(dir.join(format!("assert.{suffix}.log"))).unwrap_or_default();
            found.push(CoreDump {
                filename: f.path().to_string_lossy().into_owned(),
                assert_log,
                time: meta.ctime().clamp(0, u32::MAX as i64) as u32,
            });
            if found.len() >= MAX_COREDUMPS {
                return found;
            }
        }
    }
    found
}
