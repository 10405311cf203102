// ============================================
// winprovision - platform.rs
// ============================================
// Host facts the orchestrator needs:
//   - are we running elevated (administrator token)?
//   - is a modern PowerShell (7+) available?
//   - where does our EXE live?
// and the one platform-specific action: launching a script elevated.
// ============================================

use std::io;
use std::path::{Path, PathBuf};

use crate::process::CommandRunner;
use crate::session::{ElevatedLauncher, ElevatedProcess};

/// Lowest PowerShell major version that satisfies `requires_minimum_runtime`.
pub const MINIMUM_POWERSHELL_MAJOR: u32 = 7;

/// Get the directory where our EXE is located.
///
/// Manifests and config sources sit next to the EXE so a copy on a USB
/// stick works without installation.
pub fn app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            // Strip \\?\ prefix that canonicalize adds on Windows
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    tracing::warn!("could not determine EXE directory, using current directory");
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Detect whether `pwsh` (PowerShell 7+) is installed.
pub fn has_modern_powershell(runner: &dyn CommandRunner) -> bool {
    if runner.locate("pwsh").is_none() {
        return false;
    }

    let args = vec![
        "-NoProfile".to_string(),
        "-Command".to_string(),
        "$PSVersionTable.PSVersion.Major".to_string(),
    ];
    match runner.run("pwsh", &args) {
        Ok(out) => out
            .stdout
            .trim()
            .parse::<u32>()
            .map(|major| major >= MINIMUM_POWERSHELL_MAJOR)
            .unwrap_or(false),
        Err(_) => false,
    }
}

// ============================================
// ELEVATION CHECK
// ============================================

/// Is the current process running with an elevated (administrator) token?
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use std::mem;
    use std::ptr;
    use winapi::shared::minwindef::DWORD;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    // SAFETY: the token handle is checked before use and always closed;
    // GetTokenInformation writes at most `size` bytes into `elevation`.
    unsafe {
        let mut token: HANDLE = ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation: TOKEN_ELEVATION = mem::zeroed();
        let size = mem::size_of::<TOKEN_ELEVATION>() as DWORD;
        let mut returned: DWORD = 0;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            size,
            &mut returned,
        );
        CloseHandle(token);

        ok != 0 && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    false
}

// ============================================
// ELEVATED LAUNCH (ShellExecuteExW "runas")
// ============================================

/// Launches the generated batch script through UAC.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunAsLauncher;

#[cfg(windows)]
mod runas {
    use super::*;
    use std::ffi::OsStr;
    use std::mem;
    use std::os::windows::ffi::OsStrExt;
    use std::ptr;
    use winapi::shared::minwindef::DWORD;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::GetExitCodeProcess;
    use winapi::um::shellapi::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
    use winapi::um::winnt::HANDLE;
    use winapi::um::winuser::SW_SHOWNORMAL;

    fn wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Handle to the elevated child; closed on drop.
    pub struct RunAsProcess {
        handle: HANDLE,
    }

    impl RunAsProcess {
        fn exit_code(&self) -> io::Result<i32> {
            let mut code: DWORD = 0;
            // SAFETY: `handle` is a live process handle owned by self.
            if unsafe { GetExitCodeProcess(self.handle, &mut code) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(code as i32)
        }
    }

    impl ElevatedProcess for RunAsProcess {
        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            // SAFETY: `handle` is a live process handle owned by self.
            match unsafe { WaitForSingleObject(self.handle, 0) } {
                WAIT_OBJECT_0 => self.exit_code().map(Some),
                _ => Ok(None),
            }
        }

        fn wait(&mut self) -> io::Result<i32> {
            // SAFETY: `handle` is a live process handle owned by self.
            unsafe { WaitForSingleObject(self.handle, INFINITE) };
            self.exit_code()
        }
    }

    impl Drop for RunAsProcess {
        fn drop(&mut self) {
            // SAFETY: the handle came from ShellExecuteExW and is closed once.
            unsafe { CloseHandle(self.handle) };
        }
    }

    pub fn launch(script: &Path) -> io::Result<Box<dyn ElevatedProcess>> {
        let verb = wide(OsStr::new("runas"));
        let file = wide(OsStr::new("powershell.exe"));
        let params = wide(OsStr::new(&format!(
            "-NoProfile -ExecutionPolicy Bypass -File \"{}\"",
            script.display()
        )));

        // SAFETY: all string pointers outlive the call; the struct is
        // zero-initialised and cbSize set as the API requires.
        unsafe {
            let mut info: SHELLEXECUTEINFOW = mem::zeroed();
            info.cbSize = mem::size_of::<SHELLEXECUTEINFOW>() as DWORD;
            info.fMask = SEE_MASK_NOCLOSEPROCESS;
            info.lpVerb = verb.as_ptr();
            info.lpFile = file.as_ptr();
            info.lpParameters = params.as_ptr();
            info.lpDirectory = ptr::null();
            info.nShow = SW_SHOWNORMAL;

            if ShellExecuteExW(&mut info) == 0 {
                // ERROR_CANCELLED (1223) when the UAC prompt is declined
                return Err(io::Error::last_os_error());
            }
            if info.hProcess.is_null() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "elevated process handle was not returned",
                ));
            }

            Ok(Box::new(RunAsProcess {
                handle: info.hProcess,
            }))
        }
    }
}

impl ElevatedLauncher for RunAsLauncher {
    #[cfg(windows)]
    fn launch(&self, script: &Path) -> io::Result<Box<dyn ElevatedProcess>> {
        runas::launch(script)
    }

    #[cfg(not(windows))]
    fn launch(&self, script: &Path) -> io::Result<Box<dyn ElevatedProcess>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "elevated execution of {} is only supported on Windows",
                script.display()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeRunner;
    use crate::process::CommandOutput;

    #[test]
    fn test_modern_powershell_detection() {
        let runner = FakeRunner::new();
        assert!(!has_modern_powershell(&runner));

        runner.provide("pwsh");
        runner.respond("pwsh -NoProfile", CommandOutput::with_code(0).with_stdout("7\r\n"));
        assert!(has_modern_powershell(&runner));

        let old = FakeRunner::new();
        old.provide("pwsh");
        old.respond("pwsh -NoProfile", CommandOutput::with_code(0).with_stdout("6\n"));
        assert!(!has_modern_powershell(&old));
    }

    #[test]
    fn test_app_directory_exists() {
        assert!(app_directory().exists());
    }
}
