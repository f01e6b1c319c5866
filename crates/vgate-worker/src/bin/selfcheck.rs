use std::path::Path;

use vgate_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;

    println!(
        "vgate-selfcheck: starting with work_dir={} command={}",
        config.work_dir.display(),
        config.command
    );
    ensure_workdir(&config.work_dir).await?;
    ensure_command(&config.command).await?;
    ensure_env_present(&required_env())?;

    println!("vgate-selfcheck: ok");
    Ok(())
}

async fn ensure_workdir(path: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path).await?;

    let probe = path.join(".vgate-selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("work dir {} not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

async fn ensure_command(command: &str) -> anyhow::Result<()> {
    let program = which::which(command)
        .map_err(|e| anyhow::anyhow!("{} not available: {}", command, e))?;

    let output = tokio::process::Command::new(&program)
        .arg("-version")
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("{} not runnable: {}", program.display(), e))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "{} -version failed: {:?}",
            program.display(),
            output.status
        ));
    }
    Ok(())
}

/// Backend URLs only matter for the backends actually selected.
fn required_env() -> Vec<&'static str> {
    let mut vars = Vec::new();
    let ledger = std::env::var("LEDGER_BACKEND").unwrap_or_default();
    if !ledger.eq_ignore_ascii_case("memory") {
        vars.push("DATABASE_URL");
    }
    let store = std::env::var("STORE_BACKEND").unwrap_or_default();
    if !store.eq_ignore_ascii_case("memory") {
        vars.push("REDIS_URL");
    }
    vars
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
