//! Matching of scanned modules against the signature table.
//!
//! A file-name prefix match is only a candidate; it is confirmed by resolving
//! every probe symbol through a `RTLD_NOLOAD` handle on the already-mapped
//! module, so nothing new is loaded. Statically linked backends expose no
//! distinguishing dynamic symbols and are undetectable here.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::conflict::{Finding, RULE_CLASSIFICATION_AMBIGUOUS};
use crate::record::{ApiKind, Control, RuntimeRecord, Vendor};
use crate::scan::LoadedModule;
use crate::signatures::{RuntimeSignature, Severity, SignatureManifest};

#[derive(Debug, Default)]
pub struct Classification {
    pub records: Vec<Arc<RuntimeRecord>>,
    pub notes: Vec<Finding>,
}

pub fn default_parallelism() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// First recognized environment variable (manifest order) with a parseable
/// positive value wins; unparseable values are skipped.
fn env_limit(sig: &RuntimeSignature, env: &BTreeMap<String, String>) -> Option<u32> {
    for var in &sig.env_vars {
        let Some(raw) = env.get(var) else { continue };
        match raw.trim().parse::<u32>() {
            Ok(n) if n >= 1 => return Some(n),
            _ => {
                debug!(var = var.as_str(), value = raw.as_str(), "ignoring unparseable limit var");
            }
        }
    }
    None
}

pub fn classify(
    modules: &[LoadedModule],
    manifest: &SignatureManifest,
    env: &BTreeMap<String, String>,
) -> Classification {
    let mut out = Classification::default();
    let mut seen: BTreeSet<(PathBuf, usize)> = BTreeSet::new();

    for module in modules {
        let Some(file_name) = module.path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let candidates: Vec<&RuntimeSignature> = manifest
            .signatures
            .iter()
            .filter(|s| s.matches_file_name(file_name))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        // One record per (path, base address) pair.
        if !seen.insert((module.path.clone(), module.base_addr)) {
            continue;
        }

        let confirmed: Vec<&RuntimeSignature> = candidates
            .into_iter()
            .filter(|sig| probe::confirms(&module.path, sig))
            .collect();

        let record = match confirmed.as_slice() {
            [] => continue,
            [sig] => build_record(module, sig, env),
            many => {
                // Matches more than one signature: keep the record visible but
                // unclassified and uncontrolled. Fork-safety is the
                // conjunction of the candidates' entries.
                let fork_safe = many.iter().all(|s| s.fork_safe);
                out.notes.push(Finding {
                    rule_id: RULE_CLASSIFICATION_AMBIGUOUS.to_string(),
                    severity: Severity::Info,
                    involved_paths: vec![module.path.clone()],
                    message: format!(
                        "{file_name} matches {} signatures; recorded as unclassified",
                        many.len()
                    ),
                });
                let max = default_parallelism();
                Arc::new(RuntimeRecord::new(
                    module.path.clone(),
                    module.base_addr,
                    Vendor::Custom,
                    ApiKind::Other,
                    fork_safe,
                    Control::ReadOnly,
                    max,
                    max,
                ))
            }
        };
        debug!(
            path = %record.path.display(),
            vendor = ?record.vendor,
            controllable = record.control().is_controllable(),
            "classified runtime"
        );
        out.records.push(record);
    }

    out
}

fn build_record(
    module: &LoadedModule,
    sig: &RuntimeSignature,
    env: &BTreeMap<String, String>,
) -> Arc<RuntimeRecord> {
    let control = probe::resolve_control(&module.path, sig);
    let native_max = match &control {
        Control::Controllable(ctl) => ctl.get().unwrap_or_else(|_| default_parallelism()),
        Control::ReadOnly => default_parallelism(),
    };
    let current_limit = env_limit(sig, env).unwrap_or(native_max);
    Arc::new(RuntimeRecord::new(
        module.path.clone(),
        module.base_addr,
        sig.vendor,
        sig.api_kind,
        sig.fork_safe,
        control,
        current_limit,
        native_max,
    ))
}

#[cfg(unix)]
mod probe {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::sync::Arc;

    use crate::error::ControlError;
    use crate::record::{Control, ThreadControl};
    use crate::signatures::RuntimeSignature;

    /// Handle on an already-mapped module. `RTLD_NOLOAD` refuses to map
    /// anything new. The handle is never closed: it pins the module so that
    /// resolved entry points stay valid for the life of the process.
    fn open_noload(path: &Path) -> Option<*mut libc::c_void> {
        let cpath = CString::new(path.as_os_str().as_bytes()).ok()?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
        if handle.is_null() {
            None
        } else {
            Some(handle)
        }
    }

    fn resolve(handle: *mut libc::c_void, symbol: &str) -> Option<*mut libc::c_void> {
        let csym = CString::new(symbol).ok()?;
        let sym = unsafe { libc::dlsym(handle, csym.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            Some(sym)
        }
    }

    pub(super) fn confirms(path: &Path, sig: &RuntimeSignature) -> bool {
        let Some(handle) = open_noload(path) else {
            return false;
        };
        sig.probe_symbols
            .iter()
            .all(|s| resolve(handle, s).is_some())
    }

    pub(super) fn resolve_control(path: &Path, sig: &RuntimeSignature) -> Control {
        let (Some(get_symbol), Some(set_symbol)) = (&sig.get_symbol, &sig.set_symbol) else {
            return Control::ReadOnly;
        };
        let Some(handle) = open_noload(path) else {
            return Control::ReadOnly;
        };
        let (Some(get), Some(set)) = (resolve(handle, get_symbol), resolve(handle, set_symbol))
        else {
            return Control::ReadOnly;
        };
        let control = NativeControl {
            // Vendor worker-count entry points share the C signatures
            // `int get(void)` / `void set(int)`.
            get: unsafe { std::mem::transmute::<*mut libc::c_void, GetFn>(get) },
            set: unsafe { std::mem::transmute::<*mut libc::c_void, SetFn>(set) },
            get_symbol: get_symbol.clone(),
            set_symbol: set_symbol.clone(),
        };
        Control::Controllable(Arc::new(control))
    }

    type GetFn = unsafe extern "C" fn() -> libc::c_int;
    type SetFn = unsafe extern "C" fn(libc::c_int);

    struct NativeControl {
        get: GetFn,
        set: SetFn,
        get_symbol: String,
        set_symbol: String,
    }

    impl ThreadControl for NativeControl {
        fn get(&self) -> Result<u32, ControlError> {
            let n = unsafe { (self.get)() };
            if n < 1 {
                return Err(ControlError {
                    symbol: self.get_symbol.clone(),
                    detail: format!("reported {n} workers"),
                });
            }
            Ok(n as u32)
        }

        fn set(&self, workers: u32) -> Result<(), ControlError> {
            let Ok(n) = libc::c_int::try_from(workers) else {
                return Err(ControlError {
                    symbol: self.set_symbol.clone(),
                    detail: format!("{workers} workers exceeds the C int range"),
                });
            };
            unsafe { (self.set)(n) };
            Ok(())
        }
    }
}

#[cfg(not(unix))]
mod probe {
    use std::path::Path;

    use crate::record::Control;
    use crate::signatures::RuntimeSignature;

    pub(super) fn confirms(_path: &Path, _sig: &RuntimeSignature) -> bool {
        false
    }

    pub(super) fn resolve_control(_path: &Path, _sig: &RuntimeSignature) -> Control {
        Control::ReadOnly
    }
}
