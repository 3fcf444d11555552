//! Authentication plugins, salts and scramble checks.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};

pub const SALT_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    AuthSocket,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mysql_native_password" => Some(AuthPlugin::NativePassword),
            "caching_sha2_password" => Some(AuthPlugin::CachingSha2Password),
            "auth_socket" => Some(AuthPlugin::AuthSocket),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2Password => "caching_sha2_password",
            AuthPlugin::AuthSocket => "auth_socket",
        }
    }
}

impl std::fmt::Display for AuthPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-wide salt source. Access is serialized through the mutex.
pub struct SaltGenerator {
    rng: Mutex<StdRng>,
}

impl Default for SaltGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SaltGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 20 printable-range bytes: never NUL (the greeting NUL-terminates the
    /// salt), never above 0x7f, never `$`.
    pub fn generate(&self) -> [u8; SALT_LEN] {
        let mut rng = self.rng.lock();
        let mut salt = [0u8; SALT_LEN];
        for byte in salt.iter_mut() {
            *byte = loop {
                let b: u8 = rng.gen_range(1..=127);
                if b != b'$' {
                    break b;
                }
            };
        }
        salt
    }
}

/// SHA1(SHA1(password)), the form mysql_native_password stores.
pub fn native_password_hash(password: &str) -> [u8; 20] {
    let stage1 = Sha1::digest(password.as_bytes());
    Sha1::digest(stage1).into()
}

/// What a client sends for mysql_native_password.
pub fn scramble_native_password(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let mix = hasher.finalize();
    stage1.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect()
}

/// Check a native-password scramble against the stored double hash.
pub fn verify_native_password(scramble: &[u8], salt: &[u8], stored: &[u8; 20]) -> bool {
    if scramble.len() != 20 {
        return false;
    }
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stored);
    let mix = hasher.finalize();
    let stage1: Vec<u8> = scramble.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect();
    let candidate: [u8; 20] = Sha1::digest(&stage1).into();
    candidate == *stored
}

/// Check the cleartext password a client sends after a fast-auth failure
/// against SHA256(SHA256(password)).
pub fn verify_caching_sha2_cleartext(password: &[u8], stored: &[u8; 32]) -> bool {
    let candidate: [u8; 32] = Sha256::digest(Sha256::digest(password)).into();
    candidate == *stored
}

pub fn caching_sha2_hash(password: &str) -> [u8; 32] {
    Sha256::digest(Sha256::digest(password.as_bytes())).into()
}

/// OS account name for a UID, via getpwuid_r.
#[cfg(unix)]
pub fn username_for_uid(uid: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 4096];
    // SAFETY: `passwd` is plain old data; getpwuid_r fills it in and points
    // its string fields into `buf`, which outlives every read below.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid as libc::uid_t,
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
pub fn username_for_uid(_uid: u32) -> Option<String> {
    None
}
