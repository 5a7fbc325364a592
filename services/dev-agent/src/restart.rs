//! Restart strategies.
//!
//! After a batch of file operations the device program has to be restarted so
//! the new code runs. The cheapest way is a REPL script that evicts only the
//! changed modules and re-imports `boot` and `main`; the other strategies reset
//! the interpreter or the whole board.

use anyhow::Result;

use crate::config::RestartMode;
use crate::device::Device;

/// Remote path of the entry program. Always evicted on a script restart.
pub const ENTRY_MODULE: &str = "main.py";

const LINE_END: &str = "\r\n";

/// Remote module paths touched during one drain cycle, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchedModules {
    paths: Vec<String>,
}

impl TouchedModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a touched path. Re-touching a path moves it to the end.
    pub fn touch(&mut self, remote: impl Into<String>) {
        let remote = remote.into();
        self.paths.retain(|p| *p != remote);
        self.paths.push(remote);
    }

    /// The most recently touched path.
    pub fn last(&self) -> Option<&str> {
        self.paths.last().map(String::as_str)
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths whose cached modules must be dropped: everything touched plus the
    /// entry program.
    pub fn eviction_list(&self) -> Vec<String> {
        let mut list = self.paths.clone();
        if !list.iter().any(|p| p == ENTRY_MODULE) {
            list.push(ENTRY_MODULE.to_string());
        }
        list
    }
}

impl<S: Into<String>> FromIterator<S> for TouchedModules {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut touched = Self::new();
        for path in iter {
            touched.touch(path);
        }
        touched
    }
}

/// The REPL statement printing the "changed, restarting" notice.
pub fn restart_notice(touched: &TouchedModules) -> String {
    let module = touched.last().unwrap_or(ENTRY_MODULE);
    format!(
        "print({})",
        python_string(&format!("[dev] '{module}' changed. Restarting... "))
    )
}

/// Generate the script-restart program for a set of touched modules.
///
/// Pure text generation: the same touched set always yields the same script.
pub fn restart_script(touched: &TouchedModules) -> String {
    let evict = python_list(&touched.eviction_list());

    let lines = [
        "import sys".to_string(),
        "print('')".to_string(),
        restart_notice(touched),
        "for name in list(sys.modules):".to_string(),
        "  f = getattr(sys.modules[name], '__file__', None)".to_string(),
        format!("  if f and f.lstrip('/') in {evict}:"),
        "    print('[dev] Clear module: ' + f)".to_string(),
        "    del sys.modules[name]".to_string(),
        "try:".to_string(),
        "  print('[dev] Import boot.py')".to_string(),
        "  import boot".to_string(),
        "except ImportError:".to_string(),
        "  print('[dev] No boot.py found. Skipped.')".to_string(),
        "except Exception:".to_string(),
        "  print('[dev] Exception in boot.py')".to_string(),
        "  raise".to_string(),
        "try:".to_string(),
        "  print('[dev] Import main.py')".to_string(),
        "  import main".to_string(),
        "except KeyboardInterrupt:".to_string(),
        "  pass".to_string(),
        "except ImportError:".to_string(),
        "  print('[dev] No main.py found. Skipped.')".to_string(),
        String::new(),
    ];

    lines.join(LINE_END)
}

impl RestartMode {
    /// Restart the device program with this strategy.
    pub async fn restart(&self, device: &dyn Device, touched: &TouchedModules) -> Result<()> {
        match self {
            RestartMode::RestartScript => {
                device
                    .send_interactive_command(&restart_script(touched))
                    .await
            }
            RestartMode::SoftRestartDevice => {
                device
                    .send_interactive_command(&restart_notice(touched))
                    .await?;
                device.soft_reset().await
            }
            RestartMode::HardRestartDevice => {
                device
                    .send_interactive_command(&restart_notice(touched))
                    .await?;
                device.hard_reset().await
            }
        }
    }
}

/// Quote a string as a double-quoted Python literal.
fn python_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn python_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| python_string(s)).collect();
    format!("[{}]", quoted.join(", "))
}
