//! Named adapter-protocol templates for common debuggers.

use serde::{Deserialize, Serialize};
use tether_config::PresetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetTransport {
    Stdio,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_hint: Option<String>,
    pub transport: PresetTransport,
}

impl Preset {
    fn builtin(
        id: &str,
        display_name: &str,
        command: &str,
        args: &[&str],
        install_hint: &str,
        transport: PresetTransport,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            install_hint: Some(install_hint.to_string()),
            transport,
        }
    }
}

impl From<&PresetConfig> for Preset {
    fn from(config: &PresetConfig) -> Self {
        let transport = match config.transport.as_deref() {
            Some("tcp") => PresetTransport::Tcp,
            _ => PresetTransport::Stdio,
        };
        Self {
            id: config.id.clone(),
            display_name: config.display_name.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            install_hint: config.install_hint.clone(),
            transport,
        }
    }
}

pub fn builtin_presets() -> Vec<Preset> {
    use PresetTransport::{Stdio, Tcp};

    vec![
        Preset::builtin(
            "debugpy",
            "Python (debugpy)",
            "python",
            &["-m", "debugpy.adapter"],
            "pip install debugpy",
            Stdio,
        ),
        Preset::builtin(
            "codelldb",
            "CodeLLDB",
            "codelldb",
            &[],
            "install the CodeLLDB extension and put its adapter/codelldb on PATH",
            Stdio,
        ),
        Preset::builtin(
            "lldb-dap",
            "LLDB (lldb-dap)",
            "lldb-dap",
            &[],
            "install LLVM 18+ (ships lldb-dap)",
            Stdio,
        ),
        Preset::builtin(
            "gdb",
            "GDB",
            "gdb",
            &["--interpreter=dap"],
            "install GDB 14 or newer",
            Stdio,
        ),
        Preset::builtin(
            "delve",
            "Go (Delve)",
            "dlv",
            &["dap", "--listen=127.0.0.1:0"],
            "go install github.com/go-delve/delve/cmd/dlv@latest",
            Tcp,
        ),
        Preset::builtin(
            "php-xdebug",
            "PHP (Xdebug)",
            "php-debug-adapter",
            &[],
            "install the vscode-php-debug adapter and enable Xdebug 3",
            Stdio,
        ),
        Preset::builtin(
            "js-debug",
            "JavaScript (js-debug)",
            "js-debug-adapter",
            &[],
            "npm install -g @vscode/js-debug",
            Tcp,
        ),
    ]
}

/// Built-in presets followed by configured ones. A configured preset with the
/// id of a built-in replaces it in place.
pub fn resolve_presets(extra: &[PresetConfig]) -> Vec<Preset> {
    let mut presets = builtin_presets();
    for config in extra {
        let preset = Preset::from(config);
        match presets.iter_mut().find(|existing| existing.id == preset.id) {
            Some(existing) => *existing = preset,
            None => presets.push(preset),
        }
    }
    presets
}
