use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use phone_pilot::{Device, DeviceClaim, Point, ScreenSize};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const LONG_PRESS_MS: u32 = 3000;
const DOUBLE_TAP_GAP: Duration = Duration::from_millis(100);
const SETTLE: Duration = Duration::from_millis(800);
const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

/// Display names the model uses for `Launch`, mapped to package names.
const APP_PACKAGES: &[(&str, &str)] = &[
    ("微信", "com.tencent.mm"),
    ("WeChat", "com.tencent.mm"),
    ("QQ", "com.tencent.mobileqq"),
    ("支付宝", "com.eg.android.AlipayGphone"),
    ("Alipay", "com.eg.android.AlipayGphone"),
    ("淘宝", "com.taobao.taobao"),
    ("京东", "com.jingdong.app.mall"),
    ("美团", "com.sankuai.meituan"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("小红书", "com.xingin.xhs"),
    ("哔哩哔哩", "tv.danmaku.bili"),
    ("高德地图", "com.autonavi.minimap"),
    ("百度地图", "com.baidu.BaiduMap"),
    ("携程", "ctrip.android.view"),
    ("Chrome", "com.android.chrome"),
    ("Gmail", "com.google.android.gm"),
    ("Google Maps", "com.google.android.apps.maps"),
    ("YouTube", "com.google.android.youtube"),
    ("Settings", "com.android.settings"),
    ("设置", "com.android.settings"),
    ("Clock", "com.android.deskclock"),
    ("Contacts", "com.android.contacts"),
    ("Files", "com.android.fileexplorer"),
];

fn package_for(app: &str) -> Option<&'static str> {
    APP_PACKAGES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(app.trim()))
        .map(|(_, package)| *package)
}

fn app_for(package: &str) -> Option<&'static str> {
    APP_PACKAGES
        .iter()
        .find(|(_, p)| *p == package)
        .map(|(name, _)| *name)
}

/// A phone reached through the `adb` command line.
pub struct AdbDevice {
    claim: DeviceClaim,
    screen: ScreenSize,
}

impl AdbDevice {
    /// Claims `serial`, or the first attached device when none is given.
    pub async fn connect(serial: Option<&str>) -> Result<Self> {
        let serial = match serial {
            Some(serial) => serial.to_string(),
            None => first_device().await?,
        };
        let claim = DeviceClaim::acquire(&serial)?;

        let wm = run_adb(Some(&serial), &["shell", "wm", "size"]).await?;
        let wm = String::from_utf8_lossy(&wm);
        let screen = ScreenSize::from_wm_size(&wm)
            .ok_or_else(|| anyhow!("unexpected `wm size` output: {}", wm.trim()))?;

        info!(serial, width = screen.width, height = screen.height, "device connected");
        Ok(Self { claim, screen })
    }

    pub fn serial(&self) -> &str {
        self.claim.id()
    }

    async fn adb(&self, args: &[&str]) -> Result<Vec<u8>> {
        run_adb(Some(self.serial()), args).await
    }

    async fn shell(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let out = self.adb(&full).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn input_swipe(&self, from: Point, to: Point, duration_ms: u32) -> Result<()> {
        let (x1, y1) = self.screen.to_pixels(from);
        let (x2, y2) = self.screen.to_pixels(to);
        let args = [x1, y1, x2, y2, duration_ms].map(|v| v.to_string());
        let mut cmd = vec!["input", "swipe"];
        cmd.extend(args.iter().map(String::as_str));
        self.shell(&cmd).await?;
        Ok(())
    }

    async fn settle(&self) {
        tokio::time::sleep(SETTLE).await;
    }
}

async fn run_adb(serial: Option<&str>, args: &[&str]) -> Result<Vec<u8>> {
    let mut cmd = Command::new("adb");
    if let Some(serial) = serial {
        cmd.args(["-s", serial]);
    }
    cmd.args(args).kill_on_drop(true);
    debug!(?args, "adb");

    let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| anyhow!("adb {} timed out after {:?}", args.join(" "), COMMAND_TIMEOUT))?
        .context("failed to run adb (is it on PATH?)")?;

    if !output.status.success() {
        bail!(
            "adb {} failed ({}): {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

async fn first_device() -> Result<String> {
    let out = run_adb(None, &["devices"]).await?;
    parse_devices(&String::from_utf8_lossy(&out))
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no Android device attached (check `adb devices`)"))
}

fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let (serial, status) = line.split_once('\t')?;
            (status.trim() == "device").then(|| serial.trim().to_string())
        })
        .collect()
}

/// Pulls the focused package out of `dumpsys window` output.
fn focused_package(dumpsys: &str) -> Option<&str> {
    let line = dumpsys
        .lines()
        .find(|l| l.contains("mCurrentFocus") || l.contains("mFocusedApp"))?;
    line.split_whitespace()
        .find_map(|token| token.split_once('/').map(|(package, _)| package))
        .filter(|package| package.contains('.'))
}

fn swipe_duration_ms(from: (u32, u32), to: (u32, u32)) -> u32 {
    let dx = f64::from(from.0) - f64::from(to.0);
    let dy = f64::from(from.1) - f64::from(to.1);
    ((dx * dx + dy * dy).sqrt() as u32).clamp(300, 1000)
}

#[async_trait]
impl Device for AdbDevice {
    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        let png = self.adb(&["exec-out", "screencap", "-p"]).await?;
        if png.is_empty() {
            bail!("screencap returned no data (secure screen?)");
        }
        Ok(png)
    }

    async fn tap(&self, at: Point) -> Result<()> {
        let (x, y) = self.screen.to_pixels(at);
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()])
            .await?;
        self.settle().await;
        Ok(())
    }

    async fn long_press(&self, at: Point) -> Result<()> {
        self.input_swipe(at, at, LONG_PRESS_MS).await?;
        self.settle().await;
        Ok(())
    }

    async fn double_tap(&self, at: Point) -> Result<()> {
        let (x, y) = self.screen.to_pixels(at);
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(&["input", "tap", &x, &y]).await?;
        tokio::time::sleep(DOUBLE_TAP_GAP).await;
        self.shell(&["input", "tap", &x, &y]).await?;
        self.settle().await;
        Ok(())
    }

    async fn swipe(&self, from: Point, to: Point) -> Result<()> {
        let duration =
            swipe_duration_ms(self.screen.to_pixels(from), self.screen.to_pixels(to));
        self.input_swipe(from, to, duration).await?;
        self.settle().await;
        Ok(())
    }

    /// Types through the ADB Keyboard IME, restoring the previous keyboard afterwards.
    async fn type_text(&self, text: &str) -> Result<()> {
        let previous = self
            .shell(&["settings", "get", "secure", "default_input_method"])
            .await?;
        let previous = previous.trim();
        if previous != ADB_KEYBOARD_IME {
            self.shell(&["ime", "set", ADB_KEYBOARD_IME])
                .await
                .context("ADB Keyboard is required for typing")?;
        }

        self.shell(&["am", "broadcast", "-a", "ADB_CLEAR_TEXT"]).await?;
        let encoded = BASE64.encode(text.as_bytes());
        self.shell(&["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded])
            .await?;

        if !previous.is_empty() && previous != "null" && previous != ADB_KEYBOARD_IME {
            if let Err(e) = self.shell(&["ime", "set", previous]).await {
                warn!(error = %e, "could not restore the previous keyboard");
            }
        }
        self.settle().await;
        Ok(())
    }

    async fn launch_app(&self, name: &str) -> Result<()> {
        let package = match package_for(name) {
            Some(package) => package.to_string(),
            None if name.contains('.') && !name.contains(' ') => name.to_string(),
            None => bail!("don't know how to launch '{name}'"),
        };
        self.shell(&[
            "monkey",
            "-p",
            &package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn go_back(&self) -> Result<()> {
        self.shell(&["input", "keyevent", "4"]).await?;
        self.settle().await;
        Ok(())
    }

    async fn go_home(&self) -> Result<()> {
        self.shell(&["input", "keyevent", "3"]).await?;
        self.settle().await;
        Ok(())
    }

    async fn wait(&self, duration: Duration) -> Result<()> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn current_app(&self) -> Result<Option<String>> {
        let dumpsys = self.shell(&["dumpsys", "window"]).await?;
        Ok(focused_package(&dumpsys)
            .map(|package| app_for(package).unwrap_or(package).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_ready_devices_only() {
        let out = "List of devices attached\nemulator-5554\tdevice\n0123ABC\tunauthorized\n\n";
        assert_eq!(parse_devices(out), vec!["emulator-5554".to_string()]);
        assert!(parse_devices("List of devices attached\n").is_empty());
    }

    #[test]
    fn focused_package_from_dumpsys() {
        let out = "  mCurrentFocus=Window{1a2b u0 com.tencent.mm/com.tencent.mm.ui.LauncherUI}\n";
        assert_eq!(focused_package(out), Some("com.tencent.mm"));
        assert_eq!(app_for("com.tencent.mm"), Some("微信"));
        assert_eq!(focused_package("mCurrentFocus=null"), None);
    }

    #[test]
    fn app_lookup_ignores_ascii_case() {
        assert_eq!(package_for("chrome"), Some("com.android.chrome"));
        assert_eq!(package_for(" 淘宝 "), Some("com.taobao.taobao"));
        assert_eq!(package_for("Nonexistent"), None);
    }

    #[test]
    fn swipe_duration_is_clamped() {
        assert_eq!(swipe_duration_ms((0, 0), (10, 10)), 300);
        assert_eq!(swipe_duration_ms((0, 0), (0, 600)), 600);
        assert_eq!(swipe_duration_ms((0, 0), (0, 2400)), 1000);
    }
}
