//! Device collaborator contract, grid mapping and exclusive device claims.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;

use crate::types::{GRID_SIZE, Point};

/// Operations the step loop issues against a phone. Points are on the 0-999 grid;
/// implementations map them to physical pixels.
#[async_trait]
pub trait Device: Send + Sync {
    async fn capture_screenshot(&self) -> anyhow::Result<Vec<u8>>;
    async fn tap(&self, at: Point) -> anyhow::Result<()>;
    async fn long_press(&self, at: Point) -> anyhow::Result<()>;
    async fn double_tap(&self, at: Point) -> anyhow::Result<()>;
    async fn swipe(&self, from: Point, to: Point) -> anyhow::Result<()>;
    async fn type_text(&self, text: &str) -> anyhow::Result<()>;
    async fn launch_app(&self, name: &str) -> anyhow::Result<()>;
    async fn go_back(&self) -> anyhow::Result<()>;
    async fn go_home(&self) -> anyhow::Result<()>;
    async fn wait(&self, duration: Duration) -> anyhow::Result<()>;

    /// Foreground app name, when the device can tell.
    async fn current_app(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Physical screen resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn to_pixels(&self, point: Point) -> (u32, u32) {
        let scale = |v: i64, extent: u32| -> u32 {
            let v = v.clamp(0, GRID_SIZE - 1) as u64;
            (v * u64::from(extent) / GRID_SIZE as u64) as u32
        };
        (scale(point.x, self.width), scale(point.y, self.height))
    }

    /// Parses `wm size` output, preferring an override size when present.
    pub fn from_wm_size(output: &str) -> Option<Self> {
        let line = output
            .lines()
            .find(|l| l.starts_with("Override size:"))
            .or_else(|| output.lines().find(|l| l.starts_with("Physical size:")))?;
        let (_, dims) = line.split_once(':')?;
        let (w, h) = dims.trim().split_once('x')?;
        Some(Self {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("device '{0}' is already claimed by another session")]
pub struct AlreadyClaimed(pub String);

fn claims() -> &'static Mutex<HashSet<String>> {
    static CLAIMS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CLAIMS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive hold on a device identity for the life of a session. Released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    id: String,
}

impl DeviceClaim {
    pub fn acquire(id: impl Into<String>) -> Result<Self, AlreadyClaimed> {
        let id = id.into();
        let mut held = claims().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(id.clone()) {
            return Err(AlreadyClaimed(id));
        }
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        let mut held = claims().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_maps_to_pixels() {
        let screen = ScreenSize {
            width: 1080,
            height: 2400,
        };
        assert_eq!(screen.to_pixels(Point::new(0, 0)), (0, 0));
        assert_eq!(screen.to_pixels(Point::new(500, 500)), (540, 1200));
        assert_eq!(screen.to_pixels(Point::new(999, 999)), (1078, 2397));
    }

    #[test]
    fn wm_size_parsing() {
        let out = "Physical size: 1080x2400\n";
        assert_eq!(
            ScreenSize::from_wm_size(out),
            Some(ScreenSize {
                width: 1080,
                height: 2400
            })
        );
        let out = "Physical size: 1440x3200\nOverride size: 1080x2400\n";
        assert_eq!(ScreenSize::from_wm_size(out).map(|s| s.width), Some(1080));
        assert_eq!(ScreenSize::from_wm_size("error: no devices"), None);
    }

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let first = DeviceClaim::acquire("emulator-5554-claim-test").unwrap();
        assert_eq!(
            DeviceClaim::acquire("emulator-5554-claim-test").unwrap_err(),
            AlreadyClaimed("emulator-5554-claim-test".into())
        );
        let other = DeviceClaim::acquire("emulator-5556-claim-test");
        assert!(other.is_ok());
        drop(first);
        assert!(DeviceClaim::acquire("emulator-5554-claim-test").is_ok());
    }
}
