//! Idle probe for Linux using the X11 XScreenSaver extension.

use anyhow::{Context, Result};
use std::time::Duration;
use x11rb::connection::Connection;
use x11rb::protocol::screensaver::ConnectionExt as ScreensaverConnectionExt;
use x11rb::protocol::xproto::Window;
use x11rb::rust_connection::RustConnection;

use super::IdleProbe;

/// Reads `ms_since_user_input` from the XScreenSaver extension.
pub struct X11Probe {
    conn: RustConnection,
    root: Window,
}

impl X11Probe {
    /// Connect to the display in `DISPLAY` and verify the extension works.
    pub fn connect() -> Result<Self> {
        let (conn, screen_num) = RustConnection::connect(None)
            .context("Failed to connect to X11 display. Is DISPLAY set?")?;

        let root = conn.setup().roots[screen_num].root;

        conn.screensaver_query_info(root)
            .context("XScreenSaver extension not available")?
            .reply()
            .context("Failed to query XScreenSaver info")?;

        Ok(Self { conn, root })
    }
}

impl IdleProbe for X11Probe {
    fn idle_time(&mut self) -> Option<Duration> {
        let reply = self
            .conn
            .screensaver_query_info(self.root)
            .ok()?
            .reply()
            .ok()?;

        Some(Duration::from_millis(u64::from(reply.ms_since_user_input)))
    }
}
