use env_logger::DEFAULT_FILTER_ENV;
use env_logger::fmt::style::{AnsiColor, Style};
use log::LevelFilter;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Sets the behavior of the logger, based on passed environment variables
/// such as `RUST_LOG`.
///
/// If `log_file` is given, every record is also appended to that file. The file is
/// truncated first, so that it only contains the output of the current agent run.
pub fn setup_logging(verbose: bool, log_file: Option<&Path>) -> crate::Result<()> {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let has_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug"))
        .unwrap_or(false);

    if verbose || has_debug {
        builder.format_timestamp_millis();
    } else {
        // Shortened format
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let style = Style::new().fg_color(Some(AnsiColor::BrightBlack.into()));
            writeln!(
                buf,
                "{style}{}{style:#} {level_style}{}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
    }

    // Overwrite the defaults from env
    builder.parse_default_env();
    builder
        .try_init()
        .map_err(|e| crate::Error::GenericError(format!("Cannot initialize logging: {e}")))
}

/// Copies log output to stderr and to the agent log file.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}
