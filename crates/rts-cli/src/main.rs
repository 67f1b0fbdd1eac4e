#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use asupersync::{Budget, Cx};
use clap::{Parser, Subcommand, ValueEnum};
use rts_block::{
    ByteBlockDevice, ByteDevice, FileByteDevice, read_superblock_region, read_superblock_sector,
};
use rts_error::RtsError;
use rts_extent::{ExtentList, MetaFile};
use rts_ondisk::{RtGeometry, RtSuperblock, load_superblock};
use rts_scrub::{
    EvidenceLedger, EvidenceRecord, RtVolume, ScrubOptions, ScrubOutcome, StagingMode,
    scrub_rtsummary,
};
use rts_types::{InodeNumber, VolumeUuid};
use serde::Serialize;
use std::env::VarError;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

// ── Production Cx acquisition ───────────────────────────────────────────────

fn cli_cx(timeout_secs: Option<u64>) -> Cx {
    match timeout_secs {
        Some(secs) => Cx::for_request_with_budget(Budget::with_deadline_secs(secs)),
        None => Cx::for_request(),
    }
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "RTS_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

#[derive(Parser)]
#[command(name = "rts", about = "Realtime summary scrubber")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `RTS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the realtime geometry a superblock records and derives.
    Geometry {
        /// Dumped primary superblock sector.
        #[arg(long)]
        superblock: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Check a dumped realtime summary against its bitmap.
    Scrub {
        #[command(flatten)]
        files: VolumeFiles,
        /// Staging backend (`memory`, `spill` or `auto`); overrides
        /// `RTS_STAGING`.
        #[arg(long)]
        staging: Option<StagingMode>,
        /// Staging size above which `auto` spills to a temporary file;
        /// overrides `RTS_SPILL_THRESHOLD_BYTES`.
        #[arg(long)]
        spill_threshold: Option<u64>,
        /// Give up after this many seconds.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout_secs: Option<u64>,
        /// Append evidence records (JSONL) to this file.
        #[arg(long)]
        evidence: Option<PathBuf>,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Geometry { .. } => "geometry",
            Self::Scrub { .. } => "scrub",
        }
    }
}

/// Dumped superblock and realtime metadata files. Each metadata file is
/// taken to be mapped contiguously from block 0, sized by its length.
#[derive(Debug, Clone, clap::Args)]
struct VolumeFiles {
    /// Dumped primary superblock sector.
    #[arg(long)]
    superblock: PathBuf,
    /// Dumped realtime bitmap file.
    #[arg(long)]
    bitmap: PathBuf,
    /// Dumped realtime summary file.
    #[arg(long)]
    summary: PathBuf,
}

/// Exit status for a scrub that found corruption.
const EXIT_CORRUPT: i32 = 2;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "rts::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();

    info!(target: "rts::cli", command = command_name, "command_start");

    let result = match cli.command {
        Command::Geometry { superblock, json } => geometry_cmd(&superblock, json),
        Command::Scrub {
            files,
            staging,
            spill_threshold,
            timeout_secs,
            evidence,
            json,
        } => {
            let mut options = ScrubOptions::from_env().context("scrub options from environment")?;
            if let Some(staging) = staging {
                options.staging = staging;
            }
            if let Some(bytes) = spill_threshold {
                options.spill_threshold_bytes = bytes;
            }
            scrub_cmd(&files, &options, timeout_secs, evidence.as_deref(), json)
        }
    };

    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    match &result {
        Ok(()) => info!(target: "rts::cli", command = command_name, duration_us, "command_succeeded"),
        Err(err) => warn!(
            target: "rts::cli",
            command = command_name,
            duration_us,
            error = %format!("{err:#}"),
            "command_failed"
        ),
    }
    result
}

// ── geometry ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GeometryOutput {
    uuid: String,
    fname: String,
    version: u16,
    metadir: bool,
    checksum_ok: Option<bool>,
    realtime_groups: u32,
    derived: Option<RtGeometry>,
    cached: Option<RtGeometry>,
    consistent: bool,
}

fn geometry_report(sb: &RtSuperblock, raw: &[u8]) -> GeometryOutput {
    let derived = RtGeometry::from_superblock(sb);
    let cached = RtGeometry::cached(sb);
    GeometryOutput {
        uuid: sb.uuid.to_string(),
        fname: sb.fname.clone(),
        version: sb.version(),
        metadir: sb.has_metadir(),
        checksum_ok: sb.has_crc().then(|| sb.validate_checksum(raw).is_ok()),
        realtime_groups: sb.realtime_groups(),
        consistent: derived.is_some() && derived == cached,
        derived,
        cached,
    }
}

/// Read a dumped superblock: the 512-byte head names the sector size, and
/// the whole sector is returned for checksum validation.
fn read_superblock(cx: &Cx, path: &Path) -> Result<(RtSuperblock, Vec<u8>)> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open superblock: {}", path.display()))?;
    let head = read_superblock_region(cx, &dev)
        .with_context(|| format!("failed to read superblock: {}", path.display()))?;
    let sb = RtSuperblock::parse_superblock_region(&head)
        .with_context(|| format!("failed to parse superblock: {}", path.display()))?;
    let raw = read_superblock_sector(cx, &dev, usize::from(sb.sectsize))
        .with_context(|| format!("failed to read superblock sector: {}", path.display()))?;
    Ok((sb, raw))
}

fn geometry_cmd(path: &Path, json: bool) -> Result<()> {
    let cx = cli_cx(None);
    let (sb, raw) = read_superblock(&cx, path)?;
    let output = geometry_report(&sb, &raw);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }

    println!("uuid: {}", output.uuid);
    println!("fname: {}", output.fname);
    println!("version: {}", output.version);
    println!("metadir: {}", output.metadir);
    match output.checksum_ok {
        Some(ok) => println!("checksum: {}", if ok { "ok" } else { "BAD" }),
        None => println!("checksum: none"),
    }
    println!("realtime_groups: {}", output.realtime_groups);
    for (label, geo) in [("derived", &output.derived), ("cached", &output.cached)] {
        match geo {
            Some(geo) => println!(
                "{label}: rextents={} rbmblocks={} rsumlevels={} rsumblocks={} codec={:?}",
                geo.rextents, geo.rbmblocks, geo.rsumlevels, geo.rsumblocks, geo.codec
            ),
            None => println!("{label}: (zero extent size)"),
        }
    }
    println!("consistent: {}", output.consistent);
    Ok(())
}

// ── scrub ───────────────────────────────────────────────────────────────────

fn open_meta_file(path: &Path, ino: InodeNumber, block_size: u32) -> Result<MetaFile> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let len = dev.len_bytes();
    let blocks = ByteBlockDevice::new(dev, block_size)
        .with_context(|| format!("failed to create block device (block_size={block_size})"))?;
    let fork = ExtentList::identity(len / u64::from(block_size))?;
    Ok(MetaFile::new(ino, len, Arc::new(fork), Arc::new(blocks)))
}

/// Assemble a volume from dumped files.
fn open_volume(cx: &Cx, files: &VolumeFiles) -> Result<RtVolume> {
    let (_, raw) = read_superblock(cx, &files.superblock)?;
    let sb = load_superblock(&raw)
        .with_context(|| format!("invalid superblock: {}", files.superblock.display()))?;
    let bs = sb.block_size.get();
    let bitmap = open_meta_file(&files.bitmap, sb.rbmino, bs)?;
    let summary = open_meta_file(&files.summary, sb.rsumino, bs)?;
    Ok(RtVolume::new(sb, bitmap, summary)?)
}

fn scrub_files(
    cx: &Cx,
    vol: &RtVolume,
    options: &ScrubOptions,
) -> std::result::Result<ScrubOutcome, RtsError> {
    let locked = vol.lock_exclusive();
    scrub_rtsummary(cx, &locked, options)
}

fn append_evidence(path: &Path, records: &[EvidenceRecord]) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open evidence ledger: {}", path.display()))?;
    let mut ledger = EvidenceLedger::new(BufWriter::new(file));
    for record in records {
        ledger.append(record).context("append evidence record")?;
    }
    ledger.into_inner().flush().context("flush evidence ledger")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ScrubOutput<'a> {
    volume: String,
    status: &'static str,
    #[serde(flatten)]
    outcome: &'a ScrubOutcome,
}

fn scrub_cmd(
    files: &VolumeFiles,
    options: &ScrubOptions,
    timeout_secs: Option<u64>,
    evidence: Option<&Path>,
    json: bool,
) -> Result<()> {
    let command_span = info_span!(
        target: "rts::cli::scrub",
        "scrub",
        summary = %files.summary.display(),
        staging = %options.staging,
        output_json = json
    );
    let _command_guard = command_span.enter();

    let cx = cli_cx(timeout_secs);
    let vol = open_volume(&cx, files)?;
    let uuid: VolumeUuid = vol.superblock().uuid;

    let outcome = match scrub_files(&cx, &vol, options) {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Some(path) = evidence {
                append_evidence(path, &[EvidenceRecord::scrub_aborted(uuid, &err)])?;
            }
            return Err(err).context("scrub could not reach a verdict");
        }
    };
    if let Some(path) = evidence {
        append_evidence(path, &EvidenceRecord::from_outcome(uuid, &outcome))?;
    }

    let output = ScrubOutput {
        volume: uuid.to_string(),
        status: if outcome.is_clean() { "clean" } else { "corrupt" },
        outcome: &outcome,
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("volume: {}", output.volume);
        println!("status: {}", output.status);
        println!("stage: {}", outcome.stage);
        if let Some(finding) = outcome.result.finding() {
            println!("finding: {finding}");
        }
        println!("free_extents: {}", outcome.stats.free_extents_recorded);
        println!("summary_blocks: {}", outcome.stats.summary_blocks_compared);
        if let Some(mode) = outcome.stats.staging_mode {
            println!("staging: {mode} ({} bytes)", outcome.stats.staging_bytes);
        }
    }

    info!(
        target: "rts::cli::scrub",
        clean = outcome.is_clean(),
        stage = %outcome.stage,
        "scrub_complete"
    );
    if outcome.is_corrupt() {
        std::process::exit(EXIT_CORRUPT);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rts_harness::{VolumeBuilder, VolumeFormat};
    use rts_scrub::parse_evidence_ledger;
    use rts_scrub::evidence::EvidenceEventType;

    fn files(paths: &rts_harness::DumpPaths) -> VolumeFiles {
        VolumeFiles {
            superblock: paths.superblock.clone(),
            bitmap: paths.bitmap.clone(),
            summary: paths.summary.clone(),
        }
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!(LogFormat::parse(" JSON ").expect("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("human").expect("human"), LogFormat::Human);
        assert!(LogFormat::parse("yaml").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn scrub_flags_parse() {
        let cli = Cli::try_parse_from([
            "rts",
            "scrub",
            "--superblock",
            "sb",
            "--bitmap",
            "bm",
            "--summary",
            "sum",
            "--staging",
            "spill",
        ])
        .expect("parse");
        let Command::Scrub { staging, json, .. } = cli.command else {
            panic!("expected scrub");
        };
        assert_eq!(staging, Some(StagingMode::Spill));
        assert!(!json);
    }

    #[test]
    fn dumped_volume_scrubs_clean() {
        let vol = VolumeBuilder::new(4096)
            .format(VolumeFormat::Current)
            .free(0, 17)
            .free(2000, 3)
            .build()
            .expect("build");
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = vol.write_dump(dir.path()).expect("dump");
        let cx = Cx::for_testing();
        let rt = open_volume(&cx, &files(&paths)).expect("open");
        let outcome = scrub_files(&cx, &rt, &ScrubOptions::default()).expect("scrub");
        assert!(outcome.is_clean(), "{}", outcome.result);
        assert_eq!(outcome.stats.free_extents_recorded, 2);
    }

    #[test]
    fn dumped_volume_with_4k_sectors_scrubs_clean() {
        let vol = VolumeBuilder::new(4096)
            .format(VolumeFormat::Current)
            .sector_size(4096)
            .free(0, 17)
            .build()
            .expect("build");
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = vol.write_dump(dir.path()).expect("dump");
        assert_eq!(std::fs::metadata(&paths.superblock).expect("stat").len(), 4096);

        let cx = Cx::for_testing();
        let (sb, raw) = read_superblock(&cx, &paths.superblock).expect("read");
        assert_eq!(sb.sectsize, 4096);
        assert_eq!(geometry_report(&sb, &raw).checksum_ok, Some(true));

        let rt = open_volume(&cx, &files(&paths)).expect("open");
        let outcome = scrub_files(&cx, &rt, &ScrubOptions::default()).expect("scrub");
        assert!(outcome.is_clean(), "{}", outcome.result);
    }

    #[test]
    fn truncated_4k_superblock_fails_its_checksum() {
        let vol = VolumeBuilder::new(4096)
            .format(VolumeFormat::Current)
            .sector_size(4096)
            .build()
            .expect("build");
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = vol.write_dump(dir.path()).expect("dump");
        let sector = std::fs::read(&paths.superblock).expect("read");
        std::fs::write(&paths.superblock, &sector[..1024]).expect("truncate");

        let cx = Cx::for_testing();
        let (sb, raw) = read_superblock(&cx, &paths.superblock).expect("head parses");
        assert_eq!(geometry_report(&sb, &raw).checksum_ok, Some(false));
        assert!(open_volume(&cx, &files(&paths)).is_err());
    }

    #[test]
    fn dumped_stale_summary_is_corrupt_and_logged() {
        let mut vol = VolumeBuilder::new(4096).free(0, 17).build().expect("build");
        vol.set_summary_cell(4, 0, 0).expect("cell");
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = vol.write_dump(dir.path()).expect("dump");
        let cx = Cx::for_testing();
        let rt = open_volume(&cx, &files(&paths)).expect("open");
        let outcome = scrub_files(&cx, &rt, &ScrubOptions::default()).expect("scrub");
        assert!(outcome.is_corrupt());

        let ledger = dir.path().join("evidence.jsonl");
        let records = EvidenceRecord::from_outcome(rt.superblock().uuid, &outcome);
        append_evidence(&ledger, &records).expect("append");
        append_evidence(&ledger, &records).expect("append again");
        let parsed = parse_evidence_ledger(&std::fs::read(&ledger).expect("read"));
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0].event_type, EvidenceEventType::CorruptionDetected);
        assert_eq!(parsed[3].event_type, EvidenceEventType::ScrubCycleComplete);
    }

    #[test]
    fn geometry_report_flags_inconsistent_cache() {
        let mut vol = VolumeBuilder::new(4096).build().expect("build");
        let raw = vol.superblock_sector().expect("sector");
        let report = geometry_report(&vol.sb, &raw);
        assert!(report.consistent);
        assert_eq!(report.checksum_ok, Some(true));

        vol.sb.rextslog += 1;
        let report = geometry_report(&vol.sb, &raw);
        assert!(!report.consistent);
    }

    #[test]
    fn truncated_superblock_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sb = dir.path().join("sb");
        std::fs::write(&sb, [0_u8; 100]).expect("write");
        let cx = Cx::for_testing();
        let paths = VolumeFiles {
            superblock: sb,
            bitmap: dir.path().join("bm"),
            summary: dir.path().join("sum"),
        };
        assert!(open_volume(&cx, &paths).is_err());
    }
}
