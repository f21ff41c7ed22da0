//! Start-on-boot registration.
//!
//! Linux uses an XDG autostart desktop entry. The macOS LaunchAgent and
//! Windows Run-key variants ship with their installers; on those
//! platforms this module reports unsupported rather than guessing at
//! half of an installer's job.

#[derive(Debug, thiserror::Error)]
pub enum AutostartError {
    #[error("autostart I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("autostart is managed by the installer on this platform")]
    Unsupported,
}

#[cfg(target_os = "linux")]
mod xdg {
    use super::*;
    use std::path::PathBuf;

    const DESKTOP_FILE: &str = "vyx-client.desktop";

    pub(super) fn autostart_dir() -> Result<PathBuf, AutostartError> {
        dirs::config_dir()
            .map(|dir| dir.join("autostart"))
            .ok_or(AutostartError::Unsupported)
    }

    pub(super) fn desktop_entry() -> std::io::Result<String> {
        let exe = std::env::current_exe()?;
        Ok(format!(
            "[Desktop Entry]\n\
             Type=Application\n\
             Name=Vyx Client\n\
             Exec={}\n\
             X-GNOME-Autostart-enabled=true\n",
            exe.display()
        ))
    }

    pub(super) fn enable_in(dir: &std::path::Path) -> Result<(), AutostartError> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(DESKTOP_FILE), desktop_entry()?)?;
        Ok(())
    }

    pub(super) fn disable_in(dir: &std::path::Path) -> Result<(), AutostartError> {
        match std::fs::remove_file(dir.join(DESKTOP_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(super) fn is_enabled_in(dir: &std::path::Path) -> bool {
        dir.join(DESKTOP_FILE).exists()
    }
}

/// Register the agent to start on login.
pub fn enable() -> Result<(), AutostartError> {
    #[cfg(target_os = "linux")]
    {
        xdg::enable_in(&xdg::autostart_dir()?)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(AutostartError::Unsupported)
    }
}

/// Remove the start-on-login registration.
pub fn disable() -> Result<(), AutostartError> {
    #[cfg(target_os = "linux")]
    {
        xdg::disable_in(&xdg::autostart_dir()?)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(AutostartError::Unsupported)
    }
}

/// Whether a registration currently exists.
pub fn is_enabled() -> bool {
    #[cfg(target_os = "linux")]
    {
        xdg::autostart_dir()
            .map(|dir| xdg::is_enabled_in(&dir))
            .unwrap_or(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
