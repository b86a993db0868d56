//! Remote Desktop connection files pointing at a tunnel's local port

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::fmt::Write as _;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConnectionBar {
    #[default]
    AutoHide,
    Off,
    Pinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DesktopSize {
    /// Windowed, sized to the client window
    #[default]
    ClientSize,
    /// Full screen
    ScreenSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AudioMode {
    #[default]
    PlayLocally,
    PlayOnServer,
    DoNotPlay,
}

/// Settings rendered into a `.rdp` file
#[derive(Debug, Clone, Default)]
pub struct RdpSettings {
    pub username: Option<String>,
    pub connection_bar: ConnectionBar,
    pub desktop_size: DesktopSize,
    pub audio_mode: AudioMode,
    pub redirect_clipboard: bool,
}

impl RdpSettings {
    /// Render a connection file for a client connecting to `address`
    pub fn render(&self, address: SocketAddr) -> String {
        let (display_bar, pin_bar) = match self.connection_bar {
            ConnectionBar::AutoHide => (1, 0),
            ConnectionBar::Off => (0, 0),
            ConnectionBar::Pinned => (1, 1),
        };
        let screen_mode = match self.desktop_size {
            DesktopSize::ClientSize => 1,
            DesktopSize::ScreenSize => 2,
        };
        let audio_mode = match self.audio_mode {
            AudioMode::PlayLocally => 0,
            AudioMode::PlayOnServer => 1,
            AudioMode::DoNotPlay => 2,
        };

        let mut out = String::new();
        let _ = writeln!(out, "full address:s:{}", address);
        if let Some(username) = &self.username {
            let _ = writeln!(out, "username:s:{}", username);
        }
        let _ = writeln!(out, "screen mode id:i:{}", screen_mode);
        let _ = writeln!(out, "smart sizing:i:1");
        let _ = writeln!(out, "displayconnectionbar:i:{}", display_bar);
        let _ = writeln!(out, "pinconnectionbar:i:{}", pin_bar);
        let _ = writeln!(out, "audiomode:i:{}", audio_mode);
        let _ = writeln!(out, "redirectclipboard:i:{}", u8::from(self.redirect_clipboard));
        let _ = writeln!(out, "authentication level:i:0");
        out
    }

    pub fn write_to(&self, path: &Path, address: SocketAddr) -> Result<()> {
        fs::write(path, self.render(address))
            .context(format!("Failed to write RDP file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> SocketAddr {
        "127.0.0.1:50123".parse().unwrap()
    }

    #[test]
    fn test_default_settings() {
        let rendered = RdpSettings::default().render(address());

        assert!(rendered.starts_with("full address:s:127.0.0.1:50123\n"));
        assert!(rendered.contains("screen mode id:i:1\n"));
        assert!(rendered.contains("displayconnectionbar:i:1\n"));
        assert!(rendered.contains("pinconnectionbar:i:0\n"));
        assert!(rendered.contains("audiomode:i:0\n"));
        assert!(rendered.contains("redirectclipboard:i:0\n"));
        assert!(!rendered.contains("username:s:"));
    }

    #[test]
    fn test_custom_settings() {
        let settings = RdpSettings {
            username: Some("admin".to_string()),
            connection_bar: ConnectionBar::Off,
            desktop_size: DesktopSize::ScreenSize,
            audio_mode: AudioMode::DoNotPlay,
            redirect_clipboard: true,
        };
        let rendered = settings.render(address());

        assert!(rendered.contains("username:s:admin\n"));
        assert!(rendered.contains("screen mode id:i:2\n"));
        assert!(rendered.contains("displayconnectionbar:i:0\n"));
        assert!(rendered.contains("audiomode:i:2\n"));
        assert!(rendered.contains("redirectclipboard:i:1\n"));
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.rdp");

        let settings = RdpSettings {
            connection_bar: ConnectionBar::Pinned,
            ..Default::default()
        };
        settings.write_to(&path, address()).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("pinconnectionbar:i:1\n"));
    }
}
