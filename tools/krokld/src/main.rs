mod port;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use dialoguer::console::style;
use krok_core::{
    BankswitchType, CartConfig, Cartridge, MulticartInfo, Progress, RomDatabase, SerialTransport, autodetect_file,
    roms_from_folder,
};
use structopt::StructOpt;
use tracing::{Level, info};
use tracing_subscriber::util::SubscriberInitExt;

use crate::port::{KrokPort, PortSettings, find_krokcart, scan};

#[derive(Debug, StructOpt)]
#[structopt(name = "krokld", about = "Krokodile Cartridge loader")]
struct Opt {
    /// More output (-v info, -vv debug, -vvv trace)
    #[structopt(short, long, parse(from_occurrences), global = true)]
    verbose: u8,

    /// Serial port to try before searching all of them
    #[structopt(long, env = "KROK_PORT", global = true)]
    port: Option<String>,

    #[structopt(long, default_value = "115200", global = true)]
    baud: u32,

    /// Read timeout per poll, in milliseconds
    #[structopt(long, default_value = "10", global = true)]
    timeout_ms: u64,

    /// Remembered bankswitch types
    #[structopt(long, env = "KROK_ROM_DB", parse(from_os_str), global = true)]
    rom_db: Option<PathBuf>,

    /// Last written image, for incremental downloads
    #[structopt(long, env = "KROK_LAST_ROM", parse(from_os_str), global = true)]
    last_rom: Option<PathBuf>,

    /// Directory with the multicart menus (MC4K.a26, MCF8.a26, ...)
    #[structopt(long, env = "KROK_MENU_DIR", parse(from_os_str), global = true)]
    menu_dir: Option<PathBuf>,

    #[structopt(subcommand)]
    subcommand: Subcommands,
}

#[derive(Debug, StructOpt)]
struct TransferOpt {
    /// Bankswitch type, autodetected if left out
    #[structopt(long = "type")]
    bs_type: Option<String>,

    /// Only send sectors that changed since the last download
    #[structopt(long)]
    incremental: bool,

    /// Read everything back after writing
    #[structopt(long)]
    verify: bool,

    /// Extra attempts per sector
    #[structopt(long, default_value = "1")]
    retry: u32,
}

#[derive(Debug, StructOpt)]
enum Subcommands {
    /// Print the bankswitch type of ROM files
    Detect {
        #[structopt(parse(from_os_str), required = true)]
        files: Vec<PathBuf>,
    },
    /// Write a ROM to the cart
    Load {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        #[structopt(flatten)]
        transfer: TransferOpt,
    },
    /// Compare the cart with a ROM
    Verify {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        #[structopt(long = "type")]
        bs_type: Option<String>,
    },
    /// Build a multicart and write it to the cart
    Multicart(MulticartOpt),
    /// Look for a Krokodile Cartridge on every serial port
    Find,
    /// Remember a bankswitch type for a ROM file
    SetType {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        bs_type: String,
    },
}

#[derive(Debug, StructOpt)]
struct MulticartOpt {
    /// Multicart info file (*.mul)
    #[structopt(parse(from_os_str), required_unless = "folder")]
    info: Option<PathBuf>,

    /// Use every fitting ROM in this folder instead of an info file
    #[structopt(long, parse(from_os_str), conflicts_with = "info")]
    folder: Option<PathBuf>,

    /// MC4K, MCF8, MCF6 or MCF4 (folder mode)
    #[structopt(long, default_value = "MC4K")]
    kind: String,

    /// PAL menu (folder mode)
    #[structopt(long)]
    pal: bool,

    /// Where to keep the built image
    #[structopt(long, parse(from_os_str))]
    out: Option<PathBuf>,

    /// Save the folder selection as an info file
    #[structopt(long, parse(from_os_str))]
    save_info: Option<PathBuf>,

    /// Build the image without writing it to the cart
    #[structopt(long)]
    dry_run: bool,

    #[structopt(flatten)]
    transfer: TransferOpt,
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).compact().finish().init();
}

fn main() {
    let opt = Opt::from_args();
    setup_logging(opt.verbose);

    if let Err(e) = run(opt) {
        println!("{} {:#}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> anyhow::Result<()> {
    let settings = PortSettings {
        baud: opt.baud,
        timeout: Duration::from_millis(opt.timeout_ms),
    };

    match &opt.subcommand {
        Subcommands::Detect { files } => {
            let mut db = open_rom_db(&opt)?;
            for file in files {
                let bs_type = autodetect_file(file, Some(&mut db));
                let styled = if bs_type.is_supported() { style(bs_type.name()).green() } else { style(bs_type.name()).red() };
                println!("{}: {}", file.display(), styled);
            }
        }
        Subcommands::Load { file, transfer } => {
            let mut cart = cartridge(&opt, transfer.retry, transfer.incremental)?;
            cart.load_single(file, parse_type(transfer.bs_type.as_deref())?)
                .with_context(|| cart.message().to_string())?;
            report_loaded(&cart);
            let mut port = connect(&opt, settings)?;
            download(&mut cart, &mut port, transfer.verify)?;
        }
        Subcommands::Verify { file, bs_type } => {
            let mut cart = cartridge(&opt, 1, false)?;
            cart.load_single(file, parse_type(bs_type.as_deref())?)
                .with_context(|| cart.message().to_string())?;
            report_loaded(&cart);
            let mut port = connect(&opt, settings)?;
            verify(&mut cart, &mut port)?;
        }
        Subcommands::Multicart(mc) => {
            let mut cart = cartridge(&opt, mc.transfer.retry, mc.transfer.incremental)?;
            build_multicart(&opt, mc, &mut cart)?;
            println!("{}", style(cart.message()).green());
            if mc.dry_run {
                return Ok(());
            }
            let mut port = connect(&opt, settings)?;
            download(&mut cart, &mut port, mc.transfer.verify)?;
        }
        Subcommands::Find => {
            let found = scan(settings)?;
            if found.is_empty() {
                bail!("no Krokodile Cartridge found");
            }
            for (name, version) in found {
                println!("{} {}", style(name).bold(), style(version).dim());
            }
        }
        Subcommands::SetType { file, bs_type } => {
            let bs_type = BankswitchType::from_name(bs_type);
            if !bs_type.is_supported() {
                bail!("'{}' is not a bankswitch type the cart can run", bs_type);
            }
            let mut cart = cartridge(&opt, 0, false)?;
            cart.load_single(file, Some(bs_type)).with_context(|| cart.message().to_string())?;
            cart.remember_bs_type()?;
            println!("{} is now {}", file.display(), style(bs_type).green());
        }
    }
    Ok(())
}

fn connect(opt: &Opt, settings: PortSettings) -> anyhow::Result<KrokPort> {
    let (port, version) = find_krokcart(opt.port.as_deref(), settings)?;
    println!("Using {} on {}", style(version).bold(), port.name());
    Ok(port)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

fn open_rom_db(opt: &Opt) -> anyhow::Result<RomDatabase> {
    let path = opt
        .rom_db
        .clone()
        .or_else(|| home_dir().map(|h| h.join(".krokcom").join("romtypes.json")));
    match path {
        Some(path) => RomDatabase::open(&path).with_context(|| format!("failed to open {}", path.display())),
        None => Ok(RomDatabase::in_memory()),
    }
}

fn cartridge(opt: &Opt, retry: u32, incremental: bool) -> anyhow::Result<Cartridge> {
    let config = CartConfig {
        last_image_path: opt.last_rom.clone().or_else(|| home_dir().map(|h| h.join(".KCLASTROM.bin"))),
        menu_dir: opt.menu_dir.clone(),
        retry,
        incremental,
    };
    Ok(Cartridge::new(config).with_rom_store(open_rom_db(opt)?))
}

/// `None` and "auto" both mean autodetect.
fn parse_type(name: Option<&str>) -> anyhow::Result<Option<BankswitchType>> {
    let Some(name) = name else {
        return Ok(None);
    };
    match BankswitchType::from_name(name) {
        BankswitchType::None => bail!("unknown bankswitch type '{}'", name),
        BankswitchType::Auto => Ok(None),
        t => Ok(Some(t)),
    }
}

fn report_loaded(cart: &Cartridge) {
    println!("{}", style(cart.message()).dim());
    if cart.bs_type() != cart.detected_bs_type() {
        println!(
            "{}",
            style(format!("(detected {}, using {})", cart.detected_bs_type(), cart.bs_type())).yellow()
        );
    }
}

fn build_multicart(opt: &Opt, mc: &MulticartOpt, cart: &mut Cartridge) -> anyhow::Result<()> {
    let mut info = match (&mc.info, &mc.folder) {
        (Some(path), _) => {
            MulticartInfo::load(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        (None, Some(folder)) => {
            let kind = BankswitchType::from_name(&mc.kind);
            let mut db = open_rom_db(opt)?;
            let roms = roms_from_folder(folder, kind, Some(&mut db))?;
            println!("Found {} ROM(s) for a {} multicart", roms.len(), kind);

            let mut info = MulticartInfo::new(kind)?;
            info.ntsc = !mc.pal;
            for (row, (name, file)) in info.rows.iter_mut().zip(roms) {
                *row = (name, file.display().to_string());
            }
            info
        }
        (None, None) => bail!("either an info file or --folder is needed"),
    };

    if let Some(out) = &mc.out {
        info.bin_path = Some(out.clone());
    }
    if let Some(save) = &mc.save_info {
        info.save(save)?;
        info!("multicart info saved to {}", save.display());
    }

    cart.load_info(&info).with_context(|| cart.message().to_string())?;
    Ok(())
}

fn print_progress(p: Progress) {
    if p.done % 64 == 0 || p.done == p.total {
        println!("{}", style(format!("{:>5} / {} sectors", p.done, p.total)).dim());
    }
}

fn download<T: SerialTransport>(cart: &mut Cartridge, port: &mut T, auto_verify: bool) -> anyhow::Result<()> {
    let total = cart.enumerate_sectors(true);
    if cart.incremental() {
        println!("{}", style(cart.message()).dim());
    }
    println!("Writing {} sector(s)", total);

    cart.write_all(port, print_progress)
        .with_context(|| cart.message().to_string())?;
    println!("{}", style(cart.message()).green());

    if auto_verify {
        verify(cart, port)?;
    }
    Ok(())
}

fn verify<T: SerialTransport>(cart: &mut Cartridge, port: &mut T) -> anyhow::Result<()> {
    println!("Verifying");
    cart.verify_all(port, print_progress)
        .with_context(|| cart.message().to_string())?;
    println!("{}", style(cart.message()).green());
    Ok(())
}
