//! `strand check`: validate a scenario without running it.

use crate::programs::build_engine;
use crate::scenario::Scenario;
use std::path::Path;

pub fn execute(path: &Path) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(path)?;
    let config = scenario.runtime.clone().normalized()?;
    let plan = scenario.plan()?;
    build_engine(&plan)?;

    for planned in &plan {
        if let Some(w) = planned.spec.worker {
            if w >= config.worker {
                anyhow::bail!(
                    "service '{}' is bound to worker {} but only {} exist",
                    planned.spec.label,
                    w,
                    config.worker
                );
            }
        }
    }

    println!("{}: ok", path.display());
    println!("Workers:      {}", config.worker);
    println!("Tick:         {} ms", config.tick_ms);
    println!("Services:     {}", plan.len());
    for planned in &plan {
        let mut placement = String::new();
        if planned.spec.exclusive {
            placement.push_str(" exclusive");
        }
        if let Some(w) = planned.spec.worker {
            placement.push_str(&format!(" worker={}", w));
        }
        println!(
            "  {} {:<12} {}{}",
            planned.id,
            planned.spec.label,
            planned.spec.program,
            placement
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scenario_file(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_check_accepts_valid_scenario() {
        let file = scenario_file(
            r#"
[runtime]
worker = 2

[[service]]
label = "root"
program = "supervisor"
args = { expect = 1 }

[[service]]
label = "nap"
program = "sleeper"
worker = 1
args = { ticks = 10 }
"#,
        );
        execute(file.path()).unwrap();
    }

    #[test]
    fn test_check_rejects_out_of_range_binding() {
        let file = scenario_file(
            r#"
[runtime]
worker = 2

[[service]]
label = "root"
program = "supervisor"

[[service]]
label = "nap"
program = "sleeper"
worker = 5
args = { ticks = 10 }
"#,
        );
        let err = execute(file.path()).unwrap_err();
        assert!(err.to_string().contains("worker 5"));
    }

    #[test]
    fn test_check_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(execute(&dir.path().join("absent.toml")).is_err());
    }
}
