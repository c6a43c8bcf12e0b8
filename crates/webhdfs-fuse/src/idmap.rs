//! Maps remote owner/group names to local ids and back.
//!
//! Resolution goes through the system user and group databases (NSS). Results,
//! including misses, are memoised for the life of the mount.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMapConfig {
    /// Reported for owners with no local account.
    pub unknown_uid: u32,
    pub unknown_gid: u32,
}

impl Default for IdMapConfig {
    fn default() -> Self {
        IdMapConfig {
            unknown_uid: 65534,
            unknown_gid: 65534,
        }
    }
}

/// Lookup backend, separate from the memo so tests can supply fixed tables.
pub trait AccountDb: Send + Sync {
    fn uid_of(&self, name: &str) -> Option<u32>;
    fn gid_of(&self, name: &str) -> Option<u32>;
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// The host's passwd and group databases via the reentrant libc calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccounts;

const BUF_START: usize = 1024;
const BUF_MAX: usize = 1 << 20;

/// Runs a `get*_r` call, growing the scratch buffer on ERANGE.
fn with_buffer<T>(mut call: impl FnMut(&mut [libc::c_char]) -> (libc::c_int, Option<T>)) -> Option<T> {
    let mut len = BUF_START;
    loop {
        let mut buf = vec![0 as libc::c_char; len];
        let (rc, value) = call(&mut buf);
        if rc == libc::ERANGE && len < BUF_MAX {
            len *= 2;
            continue;
        }
        return if rc == 0 { value } else { None };
    }
}

impl AccountDb for SystemAccounts {
    fn uid_of(&self, name: &str) -> Option<u32> {
        let cname = CString::new(name).ok()?;
        with_buffer(|buf| {
            let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = std::ptr::null_mut();
            let rc = unsafe {
                libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
            };
            (rc, (!result.is_null()).then_some(pwd.pw_uid))
        })
    }

    fn gid_of(&self, name: &str) -> Option<u32> {
        let cname = CString::new(name).ok()?;
        with_buffer(|buf| {
            let mut grp: libc::group = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::group = std::ptr::null_mut();
            let rc = unsafe {
                libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
            };
            (rc, (!result.is_null()).then_some(grp.gr_gid))
        })
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        with_buffer(|buf| {
            let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = std::ptr::null_mut();
            let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
            let name = if result.is_null() || pwd.pw_name.is_null() {
                None
            } else {
                Some(unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned())
            };
            (rc, name)
        })
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        with_buffer(|buf| {
            let mut grp: libc::group = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::group = std::ptr::null_mut();
            let rc = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
            let name = if result.is_null() || grp.gr_name.is_null() {
                None
            } else {
                Some(unsafe { CStr::from_ptr(grp.gr_name) }.to_string_lossy().into_owned())
            };
            (rc, name)
        })
    }
}

#[derive(Default)]
struct Memo {
    uids: HashMap<String, Option<u32>>,
    gids: HashMap<String, Option<u32>>,
    user_names: HashMap<u32, Option<String>>,
    group_names: HashMap<u32, Option<String>>,
}

pub struct IdMapper {
    config: IdMapConfig,
    db: Box<dyn AccountDb>,
    memo: Mutex<Memo>,
}

impl IdMapper {
    pub fn new(config: IdMapConfig) -> Self {
        Self::with_db(config, Box::new(SystemAccounts))
    }

    pub fn with_db(config: IdMapConfig, db: Box<dyn AccountDb>) -> Self {
        IdMapper {
            config,
            db,
            memo: Mutex::new(Memo::default()),
        }
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, Memo> {
        match self.memo.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Local uid for a remote owner name. Numeric names are taken literally.
    pub fn uid(&self, owner: &str) -> u32 {
        if let Ok(n) = owner.parse::<u32>() {
            return n;
        }
        if let Some(cached) = self.memo().uids.get(owner) {
            return cached.unwrap_or(self.config.unknown_uid);
        }
        let found = self.db.uid_of(owner);
        if found.is_none() {
            tracing::debug!("no local account for remote owner {}", owner);
        }
        self.memo().uids.insert(owner.to_string(), found);
        found.unwrap_or(self.config.unknown_uid)
    }

    pub fn gid(&self, group: &str) -> u32 {
        if let Ok(n) = group.parse::<u32>() {
            return n;
        }
        if let Some(cached) = self.memo().gids.get(group) {
            return cached.unwrap_or(self.config.unknown_gid);
        }
        let found = self.db.gid_of(group);
        self.memo().gids.insert(group.to_string(), found);
        found.unwrap_or(self.config.unknown_gid)
    }

    /// Remote owner name for a local uid; falls back to the decimal id.
    pub fn user_name(&self, uid: u32) -> String {
        if let Some(cached) = self.memo().user_names.get(&uid) {
            return cached.clone().unwrap_or_else(|| uid.to_string());
        }
        let found = self.db.user_name(uid);
        self.memo().user_names.insert(uid, found.clone());
        found.unwrap_or_else(|| uid.to_string())
    }

    pub fn group_name(&self, gid: u32) -> String {
        if let Some(cached) = self.memo().group_names.get(&gid) {
            return cached.clone().unwrap_or_else(|| gid.to_string());
        }
        let found = self.db.group_name(gid);
        self.memo().group_names.insert(gid, found.clone());
        found.unwrap_or_else(|| gid.to_string())
    }
}
