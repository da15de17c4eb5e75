use std::env::{var, VarError};
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Error, Result};
use chrono::Utc;

fn main() -> Result<()> {
    rerun_if_git_changes()?;

    println!(
        "cargo:rustc-env=COMMIT_SHA={}",
        env_or_cmd("COMMIT_SHA", &["git", "rev-parse", "HEAD"])?
    );
    println!(
        "cargo:rustc-env=COMMIT_DATE={}",
        env_or_cmd("COMMIT_DATE", &[
            "git",
            "log",
            "-n1",
            "--pretty=format:'%ad'",
            "--date=short"
        ])?
        .trim_matches('\'')
    );
    println!("cargo:rustc-env=BUILD_DATE={}", Utc::now().date_naive());
    println!(
        "cargo:rustc-env=TARGET={}",
        var("TARGET").context("Fetching environment variable TARGET")?
    );

    Ok(())
}

fn env_or_cmd(env: &str, cmd: &[&str]) -> Result<String> {
    match var(env) {
        Ok(s) => return Ok(s),
        Err(VarError::NotPresent) => (),
        Err(e) => return Err(Error::new(e)),
    };

    let output = Command::new(cmd[0]).args(&cmd[1..]).output();
    match output {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8(output.stdout)?.trim().to_string())
        }
        _ => Ok("unknown".to_string()),
    }
}

fn rerun_if_git_changes() -> Result<()> {
    if !Path::new(".git/HEAD").exists() {
        return Ok(());
    }

    println!("cargo:rerun-if-changed=.git/HEAD");

    let contents = String::from_utf8(fs::read(".git/HEAD")?)?;
    let head_ref = contents.split(": ").collect::<Vec<_>>();
    if head_ref.len() == 2 && head_ref[0] == "ref" {
        println!("cargo:rerun-if-changed=.git/{}", head_ref[1].trim());
    }

    Ok(())
}
