//! Host sampling: input-idle time and the foreground process.
//!
//! On Windows, idle time comes from `GetLastInputInfo` and the foreground
//! process from `GetForegroundWindow` + `QueryFullProcessImageNameW`. On
//! other platforms [`WindowsProbe`] returns `WardenError::Activity`.

use std::collections::VecDeque;
use std::sync::Mutex;

#[cfg(not(target_os = "windows"))]
use tracing::warn;

use warden_core::error::WardenError;

use crate::state::Sample;

/// Process name reported when the foreground process cannot be resolved.
pub const UNKNOWN_PROCESS: &str = "unknown";

/// Source of host activity samples.
pub trait ActivityProbe: Send + Sync {
    fn sample(&self) -> impl std::future::Future<Output = Result<Sample, WardenError>> + Send;
}

/// Win32 probe.
#[derive(Debug, Clone, Default)]
pub struct WindowsProbe;

impl WindowsProbe {
    pub fn new() -> Self {
        Self
    }
}

// =============================================================================
// Windows implementation
// =============================================================================

#[cfg(target_os = "windows")]
impl ActivityProbe for WindowsProbe {
    async fn sample(&self) -> Result<Sample, WardenError> {
        let idle_secs = unsafe { idle_time_secs() };
        let (process_name, window_title) = unsafe { foreground_window_info() };
        Ok(Sample {
            idle_secs,
            process_name,
            window_title,
        })
    }
}

#[cfg(target_os = "windows")]
unsafe fn idle_time_secs() -> u64 {
    use windows_sys::Win32::System::SystemInformation::GetTickCount;
    use windows_sys::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};

    let mut info = LASTINPUTINFO {
        cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
        dwTime: 0,
    };
    if GetLastInputInfo(&mut info) == 0 {
        return 0;
    }
    // Both are 32-bit tick counts; wrapping_sub survives the 49.7 day rollover.
    u64::from(GetTickCount().wrapping_sub(info.dwTime) / 1000)
}

#[cfg(target_os = "windows")]
unsafe fn foreground_window_info() -> (String, String) {
    use windows_sys::Win32::UI::WindowsAndMessaging::*;

    let hwnd = GetForegroundWindow();
    if hwnd == 0 {
        return (UNKNOWN_PROCESS.into(), String::new());
    }

    let mut title_buf = [0u16; 512];
    let title_len = GetWindowTextW(hwnd, title_buf.as_mut_ptr(), title_buf.len() as i32);
    let title = if title_len > 0 {
        String::from_utf16_lossy(&title_buf[..title_len as usize])
    } else {
        String::new()
    };

    let mut pid = 0u32;
    GetWindowThreadProcessId(hwnd, &mut pid);
    let process = process_image_name(pid).unwrap_or_else(|| UNKNOWN_PROCESS.into());

    (process, title)
}

#[cfg(target_os = "windows")]
unsafe fn process_image_name(pid: u32) -> Option<String> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, QueryFullProcessImageNameW, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
    if handle == 0 {
        return None;
    }

    let mut buf = [0u16; 260];
    let mut len = buf.len() as u32;
    let ok = QueryFullProcessImageNameW(handle, 0, buf.as_mut_ptr(), &mut len);
    CloseHandle(handle);
    if ok == 0 || len == 0 {
        return None;
    }

    let path = String::from_utf16_lossy(&buf[..len as usize]);
    path.rsplit('\\').next().map(|s| s.to_string())
}

// =============================================================================
// Non-Windows stub
// =============================================================================

#[cfg(not(target_os = "windows"))]
impl ActivityProbe for WindowsProbe {
    async fn sample(&self) -> Result<Sample, WardenError> {
        warn!("WindowsProbe called on non-Windows platform");
        Err(WardenError::Activity(
            "Activity sampling is only available on Windows".into(),
        ))
    }
}

/// Scripted probe for tests.
///
/// Returns the queued samples in order and then keeps repeating the last
/// one. Fails if nothing was ever queued.
#[derive(Debug, Default)]
pub struct MockProbe {
    samples: Mutex<VecDeque<Sample>>,
    last: Mutex<Option<Sample>>,
}

impl MockProbe {
    pub fn new(samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().collect()),
            last: Mutex::new(None),
        }
    }

    /// Always report `sample`.
    pub fn constant(sample: Sample) -> Self {
        Self::new([sample])
    }

    pub fn push(&self, sample: Sample) {
        self.samples
            .lock()
            .expect("mock probe poisoned")
            .push_back(sample);
    }
}

impl ActivityProbe for MockProbe {
    async fn sample(&self) -> Result<Sample, WardenError> {
        let next = self.samples.lock().expect("mock probe poisoned").pop_front();
        let mut last = self.last.lock().expect("mock probe poisoned");
        if let Some(sample) = next {
            *last = Some(sample);
        }
        last.clone()
            .ok_or_else(|| WardenError::Activity("MockProbe has no samples".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_probe_repeats_last_sample() {
        let probe = MockProbe::new([Sample::new(0, "a.exe", ""), Sample::new(5, "b.exe", "")]);
        assert_eq!(probe.sample().await.unwrap().process_name, "a.exe");
        assert_eq!(probe.sample().await.unwrap().process_name, "b.exe");
        assert_eq!(probe.sample().await.unwrap().process_name, "b.exe");

        probe.push(Sample::new(0, "c.exe", ""));
        assert_eq!(probe.sample().await.unwrap().process_name, "c.exe");
    }

    #[tokio::test]
    async fn test_empty_mock_probe_fails() {
        let probe = MockProbe::default();
        assert!(matches!(
            probe.sample().await,
            Err(WardenError::Activity(_))
        ));
    }

    #[cfg(not(target_os = "windows"))]
    #[tokio::test]
    async fn test_windows_probe_unavailable_elsewhere() {
        let result = WindowsProbe::new().sample().await;
        assert!(matches!(result, Err(WardenError::Activity(_))));
    }
}
