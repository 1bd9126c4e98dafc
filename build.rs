use std::process::Command;

fn main() {
    // GIT_COMMIT from the environment takes precedence over git.
    if std::env::var_os("GIT_COMMIT").is_none() {
        let output = Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
                println!("cargo:rustc-env=GIT_COMMIT={commit}");
            }
            _ => println!("cargo:warning=git commit unavailable, version will report unknown"),
        }
    }

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-changed=build.rs");
}
