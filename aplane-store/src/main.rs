//! aplane-store — operational tooling for the signing keystore.
//!
//! Usage:
//!   aplane-store [-d DIR] init [--random]
//!   aplane-store [-d DIR] backup <all|ADDRESS> <dest>
//!   aplane-store [-d DIR] restore <all|ADDRESS> <src>
//!   aplane-store [-d DIR] verify <backup-path> [--deep]
//!   aplane-store [-d DIR] changepass [--random]
//!   aplane-store [-d DIR] inspect <keyfile|ADDRESS> [--show-private]
//!   aplane-store [-d DIR] keys
//!   aplane-store [-d DIR] templates
//!   aplane-store [-d DIR] add-template <yaml-file>
//!   aplane-store [-d DIR] add-falcon-template <yaml-file>
//!
//! The data directory comes from `-d` or the APSIGNER_DATA environment
//! variable; `aplane.toml` inside it names the store subdirectory.

mod config;

use std::error::Error;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroize;

use aplane_envelope::{open_with_master_key, SecureBuffer};
use aplane_keystore::{
    backup::backup_path, default_registry, fsutil, metadata::master_key_bytes, BackupPipeline,
    FileKeyStore, KeyRecord, KeyStore, KeystoreMetadata, PassphraseChange, PassphraseHelper,
    Registry, StoreLayout, TemplateKind, TemplateStore,
};

use config::Config;

const DATA_DIR_ENV: &str = "APSIGNER_DATA";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Version wins over everything else, before any other processing.
    if args.iter().any(|a| a == "--version" || a == "-version") {
        println!("aplane-store {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<(), Box<dyn Error>> {
    let mut data_dir: Option<PathBuf> = std::env::var(DATA_DIR_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    let mut rest: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-d" => {
                i += 1;
                data_dir = Some(PathBuf::from(args.get(i).ok_or("missing value for -d")?));
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => rest.push(other.to_string()),
        }
        i += 1;
    }

    let Some(command) = rest.first().cloned() else {
        print_usage();
        return Err("missing command".into());
    };
    let cmd_args = &rest[1..];

    let data_dir =
        data_dir.ok_or("data directory not set (use -d or the APSIGNER_DATA environment variable)")?;
    let ctx = Ctx::new(data_dir)?;

    match command.as_str() {
        "init" => cmd_init(&ctx, cmd_args),
        "backup" => cmd_backup(&ctx, cmd_args),
        "restore" => cmd_restore(&ctx, cmd_args),
        "verify" => cmd_verify(&ctx, cmd_args),
        "changepass" => cmd_changepass(&ctx, cmd_args),
        "inspect" => cmd_inspect(&ctx, cmd_args),
        "keys" => cmd_keys(&ctx),
        "templates" => cmd_templates(&ctx),
        "add-template" => cmd_add_template(&ctx, cmd_args, TemplateKind::Generic),
        "add-falcon-template" => cmd_add_template(&ctx, cmd_args, TemplateKind::DsaLsig),
        cmd => {
            print_usage();
            Err(format!("unknown command '{}'", cmd).into())
        }
    }
}

fn print_usage() {
    eprintln!(
        r#"aplane-store — signing keystore management

USAGE:
    aplane-store [-d DIR] <COMMAND> [OPTIONS]

COMMANDS:
    init [--random]                     Create a new keystore
    backup <all|ADDRESS> <dest>         Export portable encrypted backups
    restore <all|ADDRESS> <src>         Import backups into the store
    verify <backup-path> [--deep]       Audit a backup directory
    changepass [--random]               Re-key the entire store
    inspect <keyfile|ADDRESS> [--show-private]
                                        Decrypt and pretty-print one record
    keys                                List stored addresses
    templates                           List stored templates
    add-template <yaml-file>            Store a generic template
    add-falcon-template <yaml-file>     Store a dsa_lsig template

OPTIONS:
    -d DIR           Data directory (or set APSIGNER_DATA)
    -h, --help       Print help
    --version        Print version
"#
    );
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

struct Ctx {
    layout: StoreLayout,
    registry: Arc<Registry>,
    helper: Option<PassphraseHelper>,
}

impl Ctx {
    fn new(data_dir: PathBuf) -> Result<Self, Box<dyn Error>> {
        let config = Config::load(&data_dir)?;
        let layout = StoreLayout::new(data_dir.join(&config.store_dir), config.identity.clone());
        Ok(Self {
            layout,
            registry: Arc::new(default_registry()),
            helper: PassphraseHelper::new(config.passphrase_helper),
        })
    }

    fn store(&self) -> Arc<FileKeyStore> {
        Arc::new(FileKeyStore::new(self.layout.clone(), self.registry.clone()))
    }

    fn templates(&self) -> Arc<TemplateStore> {
        Arc::new(TemplateStore::new(self.layout.clone(), self.registry.clone()))
    }

    fn pipeline(&self, store: Arc<FileKeyStore>) -> BackupPipeline {
        BackupPipeline::new(
            store,
            self.templates(),
            self.registry.clone(),
            self.layout.clone(),
        )
    }

    /// The store passphrase: from the helper when configured, otherwise
    /// an interactive prompt.
    fn store_passphrase(&self) -> Result<SecureBuffer, Box<dyn Error>> {
        if let Some(helper) = &self.helper {
            return Ok(helper.read()?);
        }
        prompt_secret("Keystore passphrase: ")
    }

    /// Unlock and scan the store.
    fn unlock(&self) -> Result<Arc<FileKeyStore>, Box<dyn Error>> {
        let store = self.store();
        let passphrase = self.store_passphrase()?;
        passphrase.with_bytes(|p| store.initialize_master_key(p))?;
        passphrase.destroy();
        let count = store.scan()?;
        tracing::debug!(keys = count, "store unlocked");
        Ok(store)
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn prompt_secret(prompt: &str) -> Result<SecureBuffer, Box<dyn Error>> {
    let mut entered = rpassword::prompt_password(prompt)?;
    let buf = SecureBuffer::new_from_bytes(entered.as_bytes());
    entered.zeroize();
    Ok(buf)
}

fn prompt_secret_confirmed(prompt: &str) -> Result<SecureBuffer, Box<dyn Error>> {
    let first = prompt_secret(prompt)?;
    let second = prompt_secret("Confirm: ")?;
    let matched = first.with_bytes(|a| second.with_bytes(|b| a == b));
    second.destroy();
    if !matched {
        first.destroy();
        return Err("passphrases do not match".into());
    }
    Ok(first)
}

fn prompt_yes_no(question: &str) -> bool {
    eprint!("{} [y/N] ", question);
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y" | "yes")
}

/// 32 random bytes, base64-encoded: the generated-passphrase form.
fn random_passphrase() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let encoded = B64.encode(bytes);
    bytes.zeroize();
    encoded
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init(ctx: &Ctx, args: &[String]) -> Result<(), Box<dyn Error>> {
    let random = parse_flags(args, &["--random"])?.contains(&"--random");

    let passphrase = if random {
        let generated = random_passphrase();
        println!("Generated passphrase: {}", generated);
        println!("Store it somewhere safe; it cannot be recovered.");
        SecureBuffer::new_from_bytes(generated.as_bytes())
    } else {
        prompt_secret_confirmed("New keystore passphrase: ")?
    };

    let (_meta, master_key) =
        passphrase.with_bytes(|p| KeystoreMetadata::create(ctx.layout.root(), p))?;
    master_key.destroy();

    // Lay the directory skeleton down with group-administrable modes,
    // and drop a fresh bearer token next to the keys.
    fsutil::ensure_group_dir(&ctx.layout.keys_dir())?;
    for kind in TemplateKind::all() {
        fsutil::ensure_group_dir(&ctx.layout.templates_dir(kind))?;
    }
    let mut token = [0u8; 32];
    OsRng.fill_bytes(&mut token);
    fsutil::atomic_write(
        &ctx.layout.token_path(),
        B64.encode(token).as_bytes(),
        fsutil::FILE_MODE_PRIVATE,
    )?;

    if let Some(helper) = &ctx.helper {
        passphrase.with_bytes(|p| helper.write(p))?;
        eprintln!("Passphrase stored via helper.");
    }
    passphrase.destroy();

    println!("Keystore initialized at {}", ctx.layout.root().display());
    Ok(())
}

fn cmd_backup(ctx: &Ctx, args: &[String]) -> Result<(), Box<dyn Error>> {
    let [target, dest] = two_args(args, "backup <all|ADDRESS> <dest>")?;
    let dest = PathBuf::from(dest);

    let store = ctx.unlock()?;
    let master_key = store.master_key()?;
    let export_pass = prompt_secret_confirmed("Export passphrase: ")?;

    let pipeline = ctx.pipeline(store);
    let receipts = export_pass.with_bytes(|pass| {
        if target == "all" {
            pipeline.export_all(&master_key, pass, &dest)
        } else {
            pipeline
                .export_one(&target, &master_key, pass, &dest)
                .map(|r| vec![r])
        }
    })?;
    export_pass.destroy();

    for receipt in &receipts {
        println!(
            "{}  {} bytes  sha256:{}",
            receipt.address, receipt.size, receipt.checksum
        );
    }
    println!("Exported {} key(s) to {}", receipts.len(), dest.display());
    Ok(())
}

fn cmd_restore(ctx: &Ctx, args: &[String]) -> Result<(), Box<dyn Error>> {
    let [target, src] = two_args(args, "restore <all|ADDRESS> <src>")?;
    let src = PathBuf::from(src);

    let store = ctx.unlock()?;
    let master_key = store.master_key()?;
    let export_pass = prompt_secret("Export passphrase: ")?;

    let confirm = |address: &str| prompt_yes_no(&format!("Key {} exists. Overwrite?", address));

    let pipeline = ctx.pipeline(store.clone());
    let outcomes = export_pass.with_bytes(|pass| {
        if target == "all" {
            pipeline.restore_all(&src, &master_key, pass, &confirm)
        } else {
            let path = if src.join("apb").is_dir() {
                backup_path(&src, &target)
            } else {
                src.join(format!("{}.apb", target))
            };
            pipeline
                .restore_one(&path, &master_key, pass, &confirm)
                .map(|o| vec![(path, o)])
        }
    })?;
    export_pass.destroy();

    for (path, outcome) in &outcomes {
        println!("{}: {:?}", path.display(), outcome);
    }
    store.scan()?;
    Ok(())
}

fn cmd_verify(ctx: &Ctx, args: &[String]) -> Result<(), Box<dyn Error>> {
    let flags = parse_flags(args, &["--deep"])?;
    let deep = flags.contains(&"--deep");
    let path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .ok_or("usage: verify <backup-path> [--deep]")?;
    let path = PathBuf::from(path);

    let pipeline = ctx.pipeline(ctx.store());
    let report = if deep {
        let export_pass = prompt_secret("Export passphrase: ")?;
        let report = export_pass.with_bytes(|pass| pipeline.deep_verify(&path, pass))?;
        export_pass.destroy();
        report
    } else {
        pipeline.verify(&path)?
    };

    for entry in &report.entries {
        let status = if entry.ok { "ok" } else { "FAIL" };
        println!(
            "{}  {}  {} bytes  {}",
            status,
            entry.file.display(),
            entry.size,
            entry.note
        );
    }
    if !report.all_ok() {
        return Err("verification failed".into());
    }
    println!("{} file(s) verified", report.entries.len());
    Ok(())
}

fn cmd_changepass(ctx: &Ctx, args: &[String]) -> Result<(), Box<dyn Error>> {
    let random = parse_flags(args, &["--random"])?.contains(&"--random");

    let old_pass = if ctx.helper.is_some() {
        ctx.store_passphrase()?
    } else {
        prompt_secret("Current passphrase: ")?
    };
    let new_pass = if random {
        let generated = random_passphrase();
        println!("Generated passphrase: {}", generated);
        println!("Store it somewhere safe; it cannot be recovered.");
        SecureBuffer::new_from_bytes(generated.as_bytes())
    } else {
        prompt_secret_confirmed("New passphrase: ")?
    };

    let change = PassphraseChange::new(ctx.layout.clone(), ctx.helper.clone());
    let report = old_pass.with_bytes(|old| new_pass.with_bytes(|new| change.change(old, new)))?;
    old_pass.destroy();
    new_pass.destroy();

    println!(
        "Passphrase changed: {} artifact(s) re-encrypted, {} skipped",
        report.rewritten, report.skipped
    );
    Ok(())
}

fn cmd_inspect(ctx: &Ctx, args: &[String]) -> Result<(), Box<dyn Error>> {
    let flags = parse_flags(args, &["--show-private"])?;
    let show_private = flags.contains(&"--show-private");
    let target = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .ok_or("usage: inspect <keyfile|ADDRESS> [--show-private]")?;

    // A path on disk wins; anything else is treated as an address.
    let file = if Path::new(target).is_file() {
        PathBuf::from(target)
    } else {
        ctx.layout.key_path(target)
    };
    let bytes = std::fs::read(&file).map_err(|e| format!("read {}: {}", file.display(), e))?;

    let meta = KeystoreMetadata::load(ctx.layout.root())?
        .ok_or("keystore not initialized")?;
    let passphrase = ctx.store_passphrase()?;
    let key_buf = passphrase.with_bytes(|p| meta.verify_and_derive(p))?;
    passphrase.destroy();
    let key = master_key_bytes(&key_buf)?;
    key_buf.destroy();

    let plaintext = open_with_master_key(&bytes, &key)?;
    let mut record: KeyRecord =
        serde_json::from_slice(&plaintext).map_err(|e| format!("key record: {}", e))?;
    if !show_private && record.private_key.is_some() {
        record.private_key = Some("<redacted>".into());
    }

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn cmd_keys(ctx: &Ctx) -> Result<(), Box<dyn Error>> {
    let store = ctx.unlock()?;
    let keys = store.list()?;
    if keys.is_empty() {
        println!("no keys stored");
        return Ok(());
    }
    for meta in &keys {
        println!(
            "{}  {}  {}",
            meta.address,
            meta.key_type,
            meta.created_at.to_rfc3339()
        );
    }
    println!("{} key(s)", keys.len());
    Ok(())
}

fn cmd_templates(ctx: &Ctx) -> Result<(), Box<dyn Error>> {
    let listed = ctx.templates().list()?;
    if listed.is_empty() {
        println!("no templates stored");
        return Ok(());
    }
    for info in &listed {
        println!("{}  {}  {} bytes", info.key_type, info.kind, info.size_bytes);
    }
    Ok(())
}

fn cmd_add_template(
    ctx: &Ctx,
    args: &[String],
    kind: TemplateKind,
) -> Result<(), Box<dyn Error>> {
    let file = args.first().ok_or("usage: add-template <yaml-file>")?;
    let path = Path::new(file);
    // The template's key type is the definition file's stem.
    let key_type = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or("template file needs a <keyType>.yaml name")?;
    let definition =
        std::fs::read(path).map_err(|e| format!("read {}: {}", path.display(), e))?;

    let store = ctx.unlock()?;
    let master_key = store.master_key()?;
    let saved = ctx
        .templates()
        .save(&definition, key_type, kind, &master_key)?;
    println!("Template stored at {}", saved.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Arg helpers
// ---------------------------------------------------------------------------

/// Accept only the listed flags; return the ones present.
fn parse_flags<'a>(
    args: &[String],
    allowed: &[&'a str],
) -> Result<Vec<&'a str>, Box<dyn Error>> {
    let mut found = Vec::new();
    for arg in args {
        if let Some(flag) = allowed.iter().find(|f| *f == arg) {
            found.push(*flag);
        } else if arg.starts_with("--") {
            return Err(format!("unknown option: {}", arg).into());
        }
    }
    Ok(found)
}

fn two_args(args: &[String], usage: &str) -> Result<[String; 2], Box<dyn Error>> {
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();
    match positional.as_slice() {
        [a, b] => Ok([(*a).clone(), (*b).clone()]),
        _ => Err(format!("usage: {}", usage).into()),
    }
}
