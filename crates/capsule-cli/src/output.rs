//! Formatted output for the `plan` command.

use std::fmt::Write as _;

use capsule_common::types::NamespaceKind;
use capsule_runtime::engine::Prepared;

/// Renders the namespaces, target and mount operations of a launch.
#[must_use]
pub fn render_plan(prepared: &Prepared) -> String {
    let spec = prepared.spec();
    let request = prepared.request();
    let mut out = String::new();

    let _ = writeln!(out, "Launch plan for {}", spec.image);
    let namespaces: Vec<String> = NamespaceKind::ALL
        .iter()
        .filter(|kind| request.wants(**kind))
        .map(ToString::to_string)
        .collect();
    let verb = if request.join.is_some() { "join" } else { "create" };
    let _ = writeln!(out, "  namespaces: {verb} {}", namespaces.join(" "));
    if let Some(hostname) = &request.hostname {
        let _ = writeln!(out, "  hostname:   {hostname}");
    }

    let launcher = prepared.launcher();
    let mut program = launcher.program().display().to_string();
    for arg in launcher.args() {
        program.push(' ');
        program.push_str(arg);
    }
    let _ = writeln!(out, "  program:    {program}");

    let caps = spec.privileges.added_names();
    if !caps.is_empty() {
        let _ = writeln!(out, "  add-caps:   {}", caps.join(","));
    }

    match prepared.plan() {
        Some(plan) => {
            let _ = writeln!(out, "  mounts:     {} operations", plan.ops().len());
            for (index, op) in plan.ops().iter().enumerate() {
                let required = if op.must_succeed { "" } else { " (optional)" };
                let _ = writeln!(out, "    {:>2}. {op}{required}", index + 1);
            }
        }
        None => {
            let _ = writeln!(out, "  mounts:     none, the instance root is reused");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use capsule_common::config::EngineConfig;
    use capsule_common::options::OptionMap;
    use capsule_core::privilege::Identity;
    use capsule_runtime::engine::Engine;
    use capsule_runtime::host::{HostContext, HostSupport};

    use super::*;

    #[test]
    fn plan_lists_namespaces_in_creation_order_and_every_mount() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("alpine");
        std::fs::create_dir_all(&image).unwrap();
        let engine = Engine::new(EngineConfig {
            session_dir: dir.path().join("session"),
            ..EngineConfig::default()
        })
        .with_host(HostContext {
            support: HostSupport::full(),
            identity: Identity { uid: 1000, gid: 1000 },
            home: None,
            env: Vec::new(),
        });
        let options = OptionMap::new()
            .with_value("image", image.display().to_string())
            .with_flag("pid", true)
            .with_flag("userns", true)
            .with_flag("readonly", true)
            .with_item("command", "/bin/echo")
            .with_item("command", "ok");
        let prepared = engine.prepare(&options).unwrap();
        let text = render_plan(&prepared);

        assert!(text.contains("namespaces: create user mount pid\n"));
        assert!(text.contains("program:    /bin/echo ok\n"));
        let mounts = prepared.plan().unwrap().ops().len();
        assert!(text.contains(&format!("mounts:     {mounts} operations")));
        assert!(text.contains("(optional)"));
        let last = text.lines().last().unwrap();
        assert!(last.contains("remount") && last.contains("ro"), "{last}");
    }
}
