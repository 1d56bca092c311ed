//! Command line and `vcoin.conf` handling.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use vcoin_chainstate::policy::RelayPolicy;
use vcoin_consensus::constants::DEFAULT_COIN_CACHE_SIZE;
use vcoin_consensus::money::{Amount, COIN};
use vcoin_consensus::params::Network;
use vcoin_log::{Category, Format, Level, LogConfig};

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "vcoin.conf";
const DEFAULT_CHECK_BLOCKS: i32 = 288;
const DEFAULT_CHECK_LEVEL: u32 = 3;
const MAX_CHECK_LEVEL: u32 = 4;
const MAX_SCRIPT_THREADS: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log: LogConfig,
    pub script_threads: usize,
    pub coin_cache_size: usize,
    pub txindex: bool,
    pub reindex: bool,
    pub imports: Vec<PathBuf>,
    pub check_blocks: i32,
    pub check_level: u32,
    pub relay: RelayPolicy,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

/// Options given on the command line. `None` means "not given", so the config file (and
/// then the default) decides.
#[derive(Default)]
struct Flags {
    backend: Option<Backend>,
    data_dir: Option<PathBuf>,
    conf_path: Option<PathBuf>,
    network: Option<Network>,
    log_level: Option<Level>,
    log_format: Option<Format>,
    log_timestamps: Option<bool>,
    debug: Vec<String>,
    script_threads: Option<usize>,
    coin_cache_size: Option<usize>,
    txindex: Option<bool>,
    reindex: bool,
    imports: Vec<PathBuf>,
    check_blocks: Option<i32>,
    check_level: Option<u32>,
    limit_free_relay: Option<u32>,
    min_tx_fee: Option<Amount>,
    min_relay_tx_fee: Option<Amount>,
    accept_non_standard: Option<bool>,
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut flags = Flags::default();
    let mut args = raw_args.into_iter().peekable();

    match args.peek().map(|value| value.as_str()) {
        Some("help") => return Ok(CliAction::PrintHelp),
        Some("version") => return Ok(CliAction::PrintVersion),
        _ => {}
    }

    while let Some(arg) = args.next() {
        let mut value_for = |name: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {name}\n{}", usage()))
        };
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = value_for("--backend")?;
                flags.backend = Some(
                    Backend::parse(&value)
                        .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?,
                );
            }
            "--data-dir" | "--datadir" => {
                flags.data_dir = Some(PathBuf::from(value_for("--data-dir")?));
            }
            "--conf" => {
                flags.conf_path = Some(PathBuf::from(value_for("--conf")?));
            }
            "--network" => {
                let value = value_for("--network")?;
                flags.network = Some(
                    Network::parse(&value)
                        .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?,
                );
            }
            "--testnet" => flags.network = Some(Network::Testnet),
            "--regtest" => flags.network = Some(Network::Regtest),
            "--log-level" | "--loglevel" => {
                let value = value_for("--log-level")?;
                flags.log_level = Some(
                    Level::parse(&value)
                        .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?,
                );
            }
            "--log-format" | "--logformat" => {
                let value = value_for("--log-format")?;
                flags.log_format = Some(
                    Format::parse(&value)
                        .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?,
                );
            }
            "--log-timestamps" => flags.log_timestamps = Some(true),
            "--no-log-timestamps" => flags.log_timestamps = Some(false),
            "--debug" => flags.debug.push(value_for("--debug")?),
            "--par" => {
                let value = value_for("--par")?;
                flags.script_threads = Some(parse_number(&value, "--par")?);
            }
            "--dbcache" => {
                let value = value_for("--dbcache")?;
                flags.coin_cache_size = Some(parse_number(&value, "--dbcache")?);
            }
            "--txindex" => flags.txindex = Some(true),
            "--reindex" => flags.reindex = true,
            "--import" | "--loadblock" => {
                flags.imports.push(PathBuf::from(value_for("--import")?));
            }
            "--checkblocks" => {
                let value = value_for("--checkblocks")?;
                flags.check_blocks = Some(parse_number(&value, "--checkblocks")?);
            }
            "--checklevel" => {
                let value = value_for("--checklevel")?;
                flags.check_level = Some(parse_number(&value, "--checklevel")?);
            }
            "--limitfreerelay" => {
                let value = value_for("--limitfreerelay")?;
                flags.limit_free_relay = Some(parse_number(&value, "--limitfreerelay")?);
            }
            "--mintxfee" => {
                let value = value_for("--mintxfee")?;
                flags.min_tx_fee = Some(
                    parse_amount(&value).map_err(|err| format!("invalid --mintxfee: {err}"))?,
                );
            }
            "--minrelaytxfee" => {
                let value = value_for("--minrelaytxfee")?;
                flags.min_relay_tx_fee = Some(
                    parse_amount(&value)
                        .map_err(|err| format!("invalid --minrelaytxfee: {err}"))?,
                );
            }
            "--acceptnonstdtxn" => flags.accept_non_standard = Some(true),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let data_dir = flags
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = flags
        .conf_path
        .clone()
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf = match load_conf(&conf_path)? {
        Some(conf) => conf,
        None if flags.conf_path.is_some() => {
            return Err(format!("config file {} not found", conf_path.display()));
        }
        None => HashMap::new(),
    };

    let config = resolve(flags, &conf, data_dir, conf_path)?;
    Ok(CliAction::Run(Box::new(config)))
}

/// Merges command line flags over config file values over defaults.
fn resolve(
    flags: Flags,
    conf: &ConfFile,
    data_dir: PathBuf,
    conf_path: PathBuf,
) -> Result<Config, String> {
    let lookup = ConfLookup {
        conf,
        path: &conf_path,
    };

    let network = match flags.network {
        Some(network) => network,
        None => {
            let testnet = lookup.bool("testnet")?.unwrap_or(false);
            let regtest = lookup.bool("regtest")?.unwrap_or(false);
            match (testnet, regtest) {
                (true, true) => {
                    return Err(format!(
                        "testnet and regtest are both set in {}",
                        conf_path.display()
                    ));
                }
                (true, false) => Network::Testnet,
                (false, true) => Network::Regtest,
                (false, false) => match lookup.last("network") {
                    Some(raw) => Network::parse(raw).ok_or_else(|| lookup.invalid("network", raw))?,
                    None => Network::Mainnet,
                },
            }
        }
    };

    let backend = match flags.backend {
        Some(backend) => backend,
        None => lookup
            .parsed("backend", Backend::parse)?
            .unwrap_or(Backend::Fjall),
    };

    let mut debug = flags.debug;
    if debug.is_empty() {
        debug = lookup.all("debug").to_vec();
    }
    let categories = parse_categories(&debug)?;

    let log = LogConfig {
        level: match flags.log_level {
            Some(level) => level,
            None => lookup.parsed("loglevel", Level::parse)?.unwrap_or(Level::Info),
        },
        format: match flags.log_format {
            Some(format) => format,
            None => lookup.parsed("logformat", Format::parse)?.unwrap_or(Format::Text),
        },
        timestamps: match flags.log_timestamps {
            Some(timestamps) => timestamps,
            None => lookup.bool("logtimestamps")?.unwrap_or(true),
        },
        categories,
    };

    let script_threads = match flags.script_threads {
        Some(threads) => threads,
        None => match lookup.number::<usize>("par")? {
            Some(threads) => threads,
            None => default_script_threads(),
        },
    }
    .min(MAX_SCRIPT_THREADS);

    let coin_cache_size = match flags.coin_cache_size {
        Some(size) => size,
        None => lookup
            .number("dbcache")?
            .unwrap_or(DEFAULT_COIN_CACHE_SIZE),
    };

    let txindex = match flags.txindex {
        Some(txindex) => txindex,
        None => lookup.bool("txindex")?.unwrap_or(false),
    };

    let mut imports = flags.imports;
    if imports.is_empty() {
        imports = lookup
            .all("import")
            .iter()
            .chain(lookup.all("loadblock"))
            .map(PathBuf::from)
            .collect();
    }

    let check_blocks = match flags.check_blocks {
        Some(blocks) => blocks,
        None => lookup
            .number("checkblocks")?
            .unwrap_or(DEFAULT_CHECK_BLOCKS),
    };
    let check_level = match flags.check_level {
        Some(level) => level,
        None => lookup
            .number("checklevel")?
            .unwrap_or(DEFAULT_CHECK_LEVEL),
    };
    if check_level > MAX_CHECK_LEVEL {
        return Err(format!(
            "checklevel {check_level} is out of range (0-{MAX_CHECK_LEVEL})"
        ));
    }

    let defaults = RelayPolicy::default();
    let relay = RelayPolicy {
        min_tx_fee: match flags.min_tx_fee {
            Some(fee) => fee,
            None => lookup.amount("mintxfee")?.unwrap_or(defaults.min_tx_fee),
        },
        min_relay_tx_fee: match flags.min_relay_tx_fee {
            Some(fee) => fee,
            None => lookup
                .amount("minrelaytxfee")?
                .unwrap_or(defaults.min_relay_tx_fee),
        },
        limit_free_relay: match flags.limit_free_relay {
            Some(limit) => limit,
            None => lookup
                .number("limitfreerelay")?
                .unwrap_or(defaults.limit_free_relay),
        },
        accept_non_standard: match flags.accept_non_standard {
            Some(accept) => accept,
            None => lookup
                .bool("acceptnonstdtxn")?
                .unwrap_or(defaults.accept_non_standard),
        },
    };

    Ok(Config {
        backend,
        data_dir,
        conf_path,
        network,
        log,
        script_threads,
        coin_cache_size,
        txindex,
        reindex: flags.reindex,
        imports,
        check_blocks,
        check_level,
        relay,
    })
}

type ConfFile = HashMap<String, Vec<String>>;

struct ConfLookup<'a> {
    conf: &'a ConfFile,
    path: &'a Path,
}

impl ConfLookup<'_> {
    fn all(&self, key: &str) -> &[String] {
        self.conf.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn last(&self, key: &str) -> Option<&str> {
        self.all(key).last().map(String::as_str)
    }

    fn invalid(&self, key: &str, raw: &str) -> String {
        format!("invalid {key} '{raw}' in {}", self.path.display())
    }

    fn parsed<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, String> {
        match self.last(key) {
            Some(raw) => parse(raw).map(Some).ok_or_else(|| self.invalid(key, raw)),
            None => Ok(None),
        }
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, String> {
        self.parsed(key, parse_conf_bool)
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        self.parsed(key, |raw| raw.trim().parse::<T>().ok())
    }

    fn amount(&self, key: &str) -> Result<Option<Amount>, String> {
        match self.last(key) {
            Some(raw) => parse_amount(raw)
                .map(Some)
                .map_err(|err| format!("{}: {err}", self.invalid(key, raw))),
            None => Ok(None),
        }
    }
}

/// Reads `key=value` lines. A missing file is not an error.
fn load_conf(path: &Path) -> Result<Option<ConfFile>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };
    Ok(Some(parse_conf(&contents)))
}

fn parse_conf(contents: &str) -> ConfFile {
    let mut out = ConfFile::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value '{value}' for {name}\n{}", usage()))
}

/// `all` or `1` enables every category.
fn parse_categories(values: &[String]) -> Result<Vec<Category>, String> {
    let mut categories = Vec::new();
    for value in values {
        let value = value.trim();
        if value.is_empty() || value == "1" || value.eq_ignore_ascii_case("all") {
            return Ok(Category::ALL.to_vec());
        }
        if value == "0" {
            continue;
        }
        let category = Category::parse(value)
            .ok_or_else(|| format!("unknown debug category '{value}'"))?;
        if !categories.contains(&category) {
            categories.push(category);
        }
    }
    Ok(categories)
}

/// Accepts base units (`1000`) or a coin amount with up to eight decimals (`0.0001`).
fn parse_amount(value: &str) -> Result<Amount, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("amount is empty".to_string());
    }
    if value.starts_with('-') {
        return Err("amount must be >= 0".to_string());
    }
    let Some((whole, frac)) = value.split_once('.') else {
        return value
            .parse::<Amount>()
            .map_err(|_| format!("invalid amount '{value}'"));
    };

    let whole = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<Amount>()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    if frac.len() > 8 {
        return Err(format!("amount has too many decimal places '{value}'"));
    }
    if !frac.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(format!("invalid amount '{value}'"));
    }
    let frac = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}")
            .parse::<Amount>()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    whole
        .checked_mul(COIN)
        .and_then(|units| units.checked_add(frac))
        .ok_or_else(|| format!("amount out of range '{value}'"))
}

fn default_script_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1)
}

pub fn usage() -> String {
    [
        "Usage:",
        "  vcoind [options]",
        "  vcoind <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --data-dir <dir>  Base data directory (default: ./data)",
        "  --conf <file>  Config file path (default: <data-dir>/vcoin.conf)",
        "  --network <mainnet|testnet|regtest>  Network to follow (default: mainnet)",
        "  --testnet, --regtest  Shorthands for --network",
        "  --backend <fjall|memory>  Storage backend to use (default: fjall)",
        "  --log-level <level>  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format <text|json>  Log output format (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --debug <category>  Enable debug output for bench|mempool|reorg|orphan|script, or all (repeatable)",
        "  --par <n>  Script verification threads; 0 checks inline (default: cores, at most 16)",
        "  --dbcache <n>  Coin records cached during initial download before flushing (default: 5000)",
        "  --txindex  Maintain a full transaction index",
        "  --reindex  Rebuild the block index and coin database from blocks/blk*.dat",
        "  --import <file>  Import blocks from an external block file (repeatable)",
        "  --checkblocks <n>  Blocks verified at startup; 0 checks all (default: 288)",
        "  --checklevel <0-4>  How thorough the startup verification is (default: 3)",
        "  --limitfreerelay <n>  Free transactions relayed, in thousands of bytes per minute (default: 15)",
        "  --mintxfee <amount>  Fee per kB below which transactions are free for mining",
        "  --minrelaytxfee <amount>  Fee per kB below which transactions are free for relaying",
        "  --acceptnonstdtxn  Relay and mine non-standard transactions",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(values: &[&str]) -> Config {
        match parse_args_from(args(values)).expect("parse") {
            CliAction::Run(config) => *config,
            other => panic!("expected a run config, got {other:?}"),
        }
    }

    #[test]
    fn commands_short_circuit() {
        assert!(matches!(
            parse_args_from(args(&["help"])).expect("parse"),
            CliAction::PrintHelp
        ));
        assert!(matches!(
            parse_args_from(args(&["version", "--bogus"])).expect("parse"),
            CliAction::PrintVersion
        ));
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.conf_path, dir.path().join("vcoin.conf"));
        assert_eq!(config.coin_cache_size, DEFAULT_COIN_CACHE_SIZE);
        assert_eq!(config.check_blocks, 288);
        assert_eq!(config.check_level, 3);
        assert_eq!(config.relay.limit_free_relay, 15);
        assert!(config.script_threads >= 1 && config.script_threads <= MAX_SCRIPT_THREADS);
        assert!(!config.txindex);
        assert!(config.log.categories.is_empty());
    }

    #[test]
    fn config_file_values_yield_to_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("vcoin.conf"),
            "# node settings\n\
             regtest=1\n\
             TXINDEX = 1 ; trailing comment\n\
             dbcache=100\n\
             debug=mempool\n\
             debug=reorg\n\
             mintxfee=0.0005\n\
             par=2\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_string_lossy().to_string();

        let config = run_config(&["--data-dir", &data_dir, "--dbcache", "7"]);
        assert_eq!(config.network, Network::Regtest);
        assert!(config.txindex);
        assert_eq!(config.coin_cache_size, 7);
        assert_eq!(config.script_threads, 2);
        assert_eq!(config.relay.min_tx_fee, 50_000);
        assert_eq!(
            config.log.categories,
            vec![Category::Mempool, Category::Reorg]
        );

        let config = run_config(&["--data-dir", &data_dir, "--network", "testnet", "--par", "0"]);
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.script_threads, 0);
    }

    #[test]
    fn explicit_config_file_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.conf");
        let err = parse_args_from(args(&["--conf", &missing.to_string_lossy()]))
            .expect_err("missing conf");
        assert!(err.contains("not found"));
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(parse_args_from(args(&["--backend", "rocks"])).is_err());
        assert!(parse_args_from(args(&["--checklevel", "9"])).is_err());
        assert!(parse_args_from(args(&["--debug", "net"])).is_err());
        assert!(parse_args_from(args(&["--par"])).is_err());
        assert!(parse_args_from(args(&["--frobnicate"])).is_err());
    }

    #[test]
    fn conf_lines_accumulate_and_strip_comments() {
        let conf = parse_conf("a=1\n;note\nA = 2 # two\nflag\n=skip\n");
        assert_eq!(conf.get("a"), Some(&vec!["1".to_string(), "2".to_string()]));
        assert_eq!(conf.get("flag"), Some(&vec!["1".to_string()]));
        assert_eq!(conf.len(), 2);
    }

    #[test]
    fn amounts_parse_as_units_or_coins() {
        assert_eq!(parse_amount("1000"), Ok(1000));
        assert_eq!(parse_amount("0.0001"), Ok(10_000));
        assert_eq!(parse_amount("1.5"), Ok(150_000_000));
        assert_eq!(parse_amount(".5"), Ok(50_000_000));
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("0.000000001").is_err());
        assert!(parse_amount("1.x").is_err());
    }

    #[test]
    fn debug_all_enables_every_category() {
        assert_eq!(
            parse_categories(&["all".to_string()]).expect("categories"),
            Category::ALL.to_vec()
        );
        assert!(parse_categories(&["0".to_string()]).expect("categories").is_empty());
    }
}
