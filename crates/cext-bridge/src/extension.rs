//! Loading native extension libraries.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};

use crate::error::ExtensionError;
use crate::upcall::UpcallTable;

/// `void Init_<name>(const UpcallTable *upcalls)`
pub type InitFn = unsafe extern "C" fn(*const UpcallTable);

/// A loaded extension library.
pub struct Extension {
    name: String,
    path: PathBuf,
    library: Library,
}

impl Extension {
    /// Loads the shared library at `path`.
    ///
    /// The extension name is the file stem without a leading `lib`, so
    /// `libdigest.so` is `digest` and initialises through `Init_digest`.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::Load`] if the loader rejects the file.
    ///
    /// # Safety
    ///
    /// Loading runs the library's static initialisers, which may do anything.
    pub unsafe fn open(path: impl AsRef<Path>) -> Result<Self, ExtensionError> {
        let path = path.as_ref().to_path_buf();
        let name = extension_name(&path).ok_or_else(|| ExtensionError::InvalidName(path.clone()))?;
        // SAFETY: caller contract.
        let library = unsafe { Library::new(&path) }.map_err(|source| ExtensionError::Load {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            name,
            path,
            library,
        })
    }

    /// Opens an extension statically linked into the running executable.
    ///
    /// `Init_<name>` is resolved among the process's exported symbols, so the
    /// host must be linked with its dynamic symbol table exported.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::InvalidName`] for an empty name and
    /// [`ExtensionError::Load`] if the process handle cannot be opened.
    pub fn builtin(name: &str) -> Result<Self, ExtensionError> {
        let path = std::env::current_exe().unwrap_or_default();
        if name.is_empty() {
            return Err(ExtensionError::InvalidName(path));
        }
        let library = this_process().map_err(|source| ExtensionError::Load {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            name: name.to_owned(),
            path,
            library,
        })
    }

    /// Extension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the library was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Symbol of the init function.
    #[must_use]
    pub fn init_symbol(&self) -> String {
        format!("Init_{}", self.name)
    }

    /// Looks up the init function.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::MissingInit`] if the symbol is absent.
    ///
    /// # Safety
    ///
    /// The symbol must have the [`InitFn`] signature.
    pub(crate) unsafe fn init_fn(&self) -> Result<InitFn, ExtensionError> {
        let symbol = self.init_symbol();
        // SAFETY: caller contract.
        let init: Symbol<'_, InitFn> = unsafe { self.library.get(symbol.as_bytes()) }
            .map_err(|source| ExtensionError::MissingInit {
                name: self.name.clone(),
                symbol,
                source,
            })?;
        Ok(*init)
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_wraps)]
fn this_process() -> Result<Library, libloading::Error> {
    Ok(libloading::os::unix::Library::this().into())
}

#[cfg(windows)]
fn this_process() -> Result<Library, libloading::Error> {
    libloading::os::windows::Library::this().map(Into::into)
}

fn extension_name(path: &Path) -> Option<String> {
    let stem = path.file_stem().and_then(OsStr::to_str)?;
    let name = stem.strip_prefix("lib").unwrap_or(stem);
    (!name.is_empty()).then(|| name.to_owned())
}
