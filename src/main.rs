use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use blockarc::archive::{self, CompressOptions, Console, EntryKind, ExtractOptions, Listing, Overwrite};
use blockarc::codec::{CodecId, CodecOptions, Level};
use blockarc::error::{Error, OpError, Operation, ResultExt};
use blockarc::pipeline::PipelineConfig;
use chrono::{DateTime, Utc};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

/// `blockarc ARCHIVE INPUT...` compresses; `blockarc ARCHIVE` extracts.
#[derive(Parser, Debug)]
#[command(name = "blockarc", version, about = "Parallel block-oriented file archiver")]
struct Cli {
    /// Archive to create or read
    archive: PathBuf,
    /// Files and directories to compress
    inputs: Vec<PathBuf>,

    /// Output directory for decompression
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Compression level -2..9 (0 stores without compression)
    #[arg(short = 'L', long, allow_negative_numbers = true)]
    level: Option<i32>,
    /// Codec: gzip (default), lzw, zlib, flate, nop
    #[arg(short, long)]
    codec: Option<String>,
    /// Print archive statistics and exit
    #[arg(short, long)]
    stat: bool,
    /// Print archive contents and exit
    #[arg(short, long)]
    list: bool,
    /// Check integrity only
    #[arg(long)]
    integ: bool,
    /// During decompression, skip files that fail the checksum
    #[arg(long)]
    xinteg: bool,
    /// Replace existing output files without prompting
    #[arg(short, long)]
    force: bool,
    /// Preset dictionary file (zlib and flate only)
    #[arg(long)]
    dict: Option<PathBuf>,
    /// Emit statistics or the listing as JSON
    #[arg(long)]
    json: bool,
    /// Worker slots (default: logical CPUs)
    #[arg(short = 'j', long)]
    workers: Option<usize>,
    /// Uncompressed block size in KiB (default 1024)
    #[arg(long)]
    block_size: Option<usize>,
    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Compress,
    Stat,
    List,
    Integrity,
    Decompress,
}

impl Cli {
    fn mode(&self) -> Mode {
        if !self.inputs.is_empty() {
            Mode::Compress
        } else if self.stat {
            Mode::Stat
        } else if self.list {
            Mode::List
        } else if self.integ {
            Mode::Integrity
        } else {
            Mode::Decompress
        }
    }

    /// Flags that were given but mean nothing in `mode`.
    fn ignored(&self, mode: Mode) -> Vec<&'static str> {
        let set: [(&str, bool, &[Mode]); 12] = [
            ("-o",           self.output.is_some(),     &[Mode::Decompress]),
            ("-L",           self.level.is_some(),      &[Mode::Compress]),
            ("-c",           self.codec.is_some(),      &[Mode::Compress]),
            ("-s",           self.stat,                 &[Mode::Stat]),
            ("-l",           self.list,                 &[Mode::List]),
            ("--integ",      self.integ,                &[Mode::Integrity]),
            ("--xinteg",     self.xinteg,               &[Mode::Decompress]),
            ("-f",           self.force,                &[Mode::Decompress]),
            ("--dict",       self.dict.is_some(),       &[Mode::Compress, Mode::Decompress]),
            ("--json",       self.json,                 &[Mode::Stat, Mode::List]),
            ("-j",           self.workers.is_some(),    &[Mode::Compress, Mode::Decompress, Mode::Integrity]),
            ("--block-size", self.block_size.is_some(), &[Mode::Compress]),
        ];
        set.iter()
            .filter(|(_, given, modes)| *given && !modes.contains(&mode))
            .map(|(flag, _, _)| *flag)
            .collect()
    }

    fn pipeline(&self) -> Result<PipelineConfig, Error> {
        let mut cfg = PipelineConfig::default();
        if let Some(w) = self.workers {
            cfg.workers = w;
        }
        if let Some(kib) = self.block_size {
            cfg.block_size = kib.saturating_mul(1024);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn dictionary(&self) -> Result<Option<Vec<u8>>, Error> {
        self.dict
            .as_ref()
            .map(|p| fs::read(p).map_err(|source| Error::Open { path: p.clone(), source }))
            .transpose()
    }

    fn codec_options(&self) -> Result<CodecOptions, Error> {
        let name = self.codec.as_deref().unwrap_or("gzip");
        let id = CodecId::from_name(name).ok_or_else(|| Error::Argument(format!("unknown codec '{name}'")))?;
        let level = Level::new(self.level.unwrap_or(Level::DEFAULT.get()))
            .map_err(|e| Error::Argument(e.to_string()))?;
        let mut opts = CodecOptions::new(id).with_level(level);
        if let Some(dict) = self.dictionary()? {
            opts = opts.with_dictionary(dict);
        }
        opts.validate().map_err(|e| Error::Argument(e.to_string()))?;
        Ok(opts)
    }
}

// ── Terminal console ─────────────────────────────────────────────────────────

struct Terminal;

impl Console for Terminal {
    fn archived(&mut self, path: &str) {
        println!("{path}");
    }

    fn extracted(&mut self, path: &str) {
        println!("{path}");
    }

    fn crc_mismatch(&mut self, path: &str) {
        println!("CRC mismatch for {path}");
    }

    fn verified(&mut self, path: &str, intact: bool) {
        if intact {
            println!("OK: {path}");
        } else {
            println!("damaged: {path}");
        }
    }

    fn overwrite(&mut self, path: &Path) -> Overwrite {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("{} already exists. Replace? [y]es/[n]o/[a]ll: ", path.display());
            let _ = io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return Overwrite::Skip,
                Ok(_) => {}
            }
            match line.trim().chars().next().map(|c| c.to_ascii_lowercase()) {
                Some('y') => return Overwrite::Replace,
                Some('n') => return Overwrite::Skip,
                Some('a') => return Overwrite::ReplaceAll,
                _ => continue,
            }
        }
    }
}

// ── Rendering ────────────────────────────────────────────────────────────────

fn format_time(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value).map_err(io::Error::from).context("rendering JSON")?;
    println!("{text}");
    Ok(())
}

fn print_stat(archive: &Path, listing: &Listing) {
    println!("Archive: {}  codec: {}", archive.display(), listing.codec);
    println!("{:<4} {:>12} {:>12} {:>6}  {:<19}  Path", "Type", "Size", "Compressed", "Ratio", "Modified");
    for e in &listing.entries {
        let (kind, size, packed, pct, mtime) = match e.kind {
            EntryKind::Dir     => ("d", String::new(), String::new(), String::new(), String::new()),
            EntryKind::Symlink => ("l", String::new(), String::new(), String::new(), String::new()),
            EntryKind::File    => (
                "f",
                e.size.to_string(),
                e.compressed.to_string(),
                ratio(e.size, e.compressed),
                format_time(e.mtime),
            ),
        };
        match &e.target {
            Some(target) => println!("{kind:<4} {size:>12} {packed:>12} {pct:>6}  {mtime:<19}  {} -> {target}", e.path),
            None         => println!("{kind:<4} {size:>12} {packed:>12} {pct:>6}  {mtime:<19}  {}", e.path),
        }
    }
    println!(
        "{} file(s), {} symlink(s), {} dir(s); {} -> {} bytes ({})",
        listing.files,
        listing.symlinks,
        listing.dirs,
        listing.total_size,
        listing.total_compressed,
        ratio(listing.total_size, listing.total_compressed),
    );
}

fn ratio(size: i64, compressed: u64) -> String {
    if size <= 0 {
        return "-".into();
    }
    format!("{:.1}%", compressed as f64 * 100.0 / size as f64)
}

// ── Entry point ──────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("BLOCKARC_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<(), OpError> {
    let mode = cli.mode();
    for flag in cli.ignored(mode) {
        eprintln!("{flag}: ignored");
    }
    let runtime = |e: Error| OpError::new(Operation::Runtime, e);
    let pipeline = cli.pipeline().map_err(runtime)?;

    match mode {
        Mode::Compress => {
            let opts = CompressOptions { codec: cli.codec_options().map_err(runtime)?, pipeline };
            archive::compress(&cli.archive, &cli.inputs, &opts, &mut Terminal)
                .map_err(|e| OpError::new(Operation::Compress, e))?;
        }
        Mode::Decompress => {
            let opts = ExtractOptions {
                out_dir:         cli.output.clone().unwrap_or_else(|| PathBuf::from(".")),
                replace_all:     cli.force,
                integrity_check: cli.xinteg,
                dictionary:      cli.dictionary().map_err(runtime)?,
                pipeline,
            };
            archive::decompress(&cli.archive, &opts, &mut Terminal)
                .map_err(|e| OpError::new(Operation::Decompress, e))?;
        }
        Mode::Integrity => {
            archive::verify(&cli.archive, &pipeline, &mut Terminal)
                .map_err(|e| OpError::new(Operation::Integrity, e))?;
        }
        Mode::Stat | Mode::List => {
            let read_err = |e: Error| OpError::new(Operation::Decompress, e);
            let listing = archive::inspect(&cli.archive).map_err(read_err)?;
            match (mode, cli.json) {
                (Mode::Stat, true)  => print_json(&listing).map_err(runtime)?,
                (Mode::Stat, false) => print_stat(&cli.archive, &listing),
                (_, true) => {
                    let paths: Vec<&str> = listing.stored().map(|e| e.path.as_str()).collect();
                    print_json(&paths).map_err(runtime)?;
                }
                (_, false) => {
                    for e in listing.stored() {
                        println!("{}", e.path);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Parse the command line.  Help and version exit normally; any other
/// usage error exits with the runtime code, not clap's default of 2.
fn parse_cli() -> Result<Cli, ExitCode> {
    Cli::try_parse().map_err(|e| match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
            e.exit()
        }
        _ => {
            let _ = e.print();
            ExitCode::from(Operation::Runtime.exit_code())
        }
    })
}

fn main() -> ExitCode {
    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(code) => return code,
    };
    init_tracing(cli.verbose);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("blockarc: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
