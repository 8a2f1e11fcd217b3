use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: cargo xtask <command>");
        eprintln!("\nAvailable commands:");
        eprintln!("  install    Install the daemon binary");
        std::process::exit(1);
    }

    match args[1].as_str() {
        "install" => install_all(),
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            std::process::exit(1);
        }
    }
}

fn install_all() -> Result<(), Box<dyn std::error::Error>> {
    let binaries = vec!["lx-daemon"];

    println!("Building lynx binaries in release mode...\n");

    let mut build = Command::new("cargo");
    build.arg("build").arg("--release");
    for binary in &binaries {
        build.arg("-p").arg(binary);
    }
    let status = build.status()?;
    if !status.success() {
        return Err("build failed".into());
    }

    let bin_dir = dirs::home_dir()
        .ok_or("Could not determine home directory")?
        .join(".local/bin");
    fs::create_dir_all(&bin_dir)?;

    for binary in &binaries {
        let src = PathBuf::from("target/release").join(binary);
        let dst = bin_dir.join(binary);
        fs::copy(&src, &dst)?;
        println!("Installed {}", dst.display());
    }

    println!("\nMake sure {} is on your PATH", bin_dir.display());
    Ok(())
}
