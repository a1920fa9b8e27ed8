use std::io::Write;
use std::path::Path;

use env_logger::{Builder, Env, Target};

/// Install the process-wide logger. Records go to stderr unless a log file
/// is given, in which case they are appended to it.
pub fn init_logger(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let target = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Target::Pipe(Box::new(file))
        }
        None => Target::Stderr,
    };

    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:<5}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(target)
        .try_init()?;

    Ok(())
}
