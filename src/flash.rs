//! Erase and reflash a board through its debugger before a run.
use std::path::Path;

use tokio::process::Command;

use crate::config::BoardConfig;

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("Failed to run {program}: {source}")]
    Spawn { program: String, source: std::io::Error },

    #[error("{board}: `{command}` exited with {status}")]
    Failed { board: String, command: String, status: std::process::ExitStatus },
}

/// One external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStep {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl ToolStep {
    fn display(&self) -> String {
        std::iter::once(self.program.to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Erase, load bootloader, load application. `None` unless the board
/// names a debugger, a target and a bootloader target.
pub fn flash_plan(cfg: &BoardConfig) -> Option<Vec<ToolStep>> {
    let dbg = cfg.debugger_serial.as_deref()?;
    let target = cfg.target.as_deref()?;
    let bl_target = cfg.bl_target.as_deref()?;
    let select = format!("-select usb={}", dbg);

    let load = |what: &str| ToolStep {
        program: "newt",
        args: vec!["load".into(), what.into(), "--extrajtagcmd".into(), select.clone()],
    };
    Some(vec![
        ToolStep {
            program: "nrfjprog",
            args: vec!["-f".into(), "NRF52".into(), "-e".into(), "-s".into(), dbg.into()],
        },
        load(bl_target),
        load(target),
    ])
}

/// Run the flash plan for one board inside `workdir`. Boards without a
/// complete debugger setup are skipped.
pub async fn prepare(cfg: &BoardConfig, workdir: &Path) -> Result<bool, FlashError> {
    let Some(plan) = flash_plan(cfg) else {
        log::debug!("{}: no debugger configured, not flashing", cfg.name);
        return Ok(false);
    };

    for step in plan {
        let command = step.display();
        log::info!("{}: {}", cfg.name, command);
        let status = Command::new(step.program)
            .args(&step.args)
            .current_dir(workdir)
            .status()
            .await
            .map_err(|source| FlashError::Spawn { program: step.program.to_string(), source })?;
        if !status.success() {
            return Err(FlashError::Failed { board: cfg.name.clone(), command, status });
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_requires_all_three_keys() {
        let mut cfg = BoardConfig::new("a", "NtwrBoard");
        cfg.debugger_serial = Some("683".into());
        cfg.target = Some("ntwr_app".into());
        assert!(flash_plan(&cfg).is_none());

        cfg.bl_target = Some("ntwr_boot".into());
        let plan = flash_plan(&cfg).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].display(), "nrfjprog -f NRF52 -e -s 683");
        assert_eq!(plan[1].args[1], "ntwr_boot");
        assert_eq!(plan[2].display(), "newt load ntwr_app --extrajtagcmd -select usb=683");
    }

    #[tokio::test]
    async fn test_prepare_skips_unconfigured_board() {
        let cfg = BoardConfig::new("a", "NtwrBoard");
        assert!(!prepare(&cfg, Path::new(".")).await.unwrap());
    }
}
