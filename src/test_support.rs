//! Helpers shared by unit tests

use std::sync::OnceLock;

/// Path to a stand-in agent that ignores its arguments and evals `$SCRIPT`
///
/// Written once per test process so no test ever forks while the file is
/// still open for writing.
pub fn fake_agent() -> String {
    static AGENT: OnceLock<String> = OnceLock::new();

    AGENT
        .get_or_init(|| {
            let path = std::env::temp_dir()
                .join(format!("cadence-fake-agent-{}.sh", std::process::id()));
            std::fs::write(&path, "#!/bin/sh\neval \"$SCRIPT\"\n").unwrap();

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            path.display().to_string()
        })
        .clone()
}
