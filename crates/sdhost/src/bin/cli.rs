use std::io::Write;

use anyhow::Context;
use clap::Parser;
use sdhost::volume::{self, Entry};
use sdhost::{Args, BlockStream, CardInfo, SdCard, SdHost, SdhcProtocol, SimulatedSdHost};
use sdhost_hw::specs::clock::DEFAULT_SPEED_HZ;
use tracing::info;

type Host = SdHost<SimulatedSdHost, sdhost::StdPlatform>;

fn main() {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let sim = match SimulatedSdHost::open(&args.image) {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("Failed to open SD card image {:?}: {}", args.image, e);
            std::process::exit(2);
        }
    };

    info!(
        "=== SDHC{} over {:?} (poll budget {:?}) ===",
        args.id,
        args.image,
        args.poll_budget()
    );
    let host = SdHost::new(sim, args.to_platform(), args.to_host_config());

    let exit_code = match run(&args, host) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

fn run(args: &Args, host: Host) -> anyhow::Result<()> {
    let mut card = SdCard::init(host).context("card identification failed")?;

    if args.sd_clock_hz() != DEFAULT_SPEED_HZ {
        card.host_mut()
            .set_clock(args.sd_clock_hz())
            .context("failed to program the SD clock")?;
    }

    print_info(card.info());

    if let Some(lba) = args.dump_sector {
        let mut block = [0u8; 512];
        card.read_block(lba, &mut block)
            .with_context(|| format!("failed to read block {lba}"))?;
        print_hex_dump(lba, &block);
    }

    if args.list || args.extract.is_some() {
        let mut stream = BlockStream::new(card);
        browse(args, &mut stream)?;
        card = stream.into_card();
    }

    card.deselect().context("failed to deselect the card")?;
    card.into_host().cleanup();
    Ok(())
}

fn browse(args: &Args, stream: &mut BlockStream<Host>) -> anyhow::Result<()> {
    let volume = volume::mount(stream).context("failed to mount FAT volume")?;
    info!("FAT volume {:?} ({:?})", volume.volume_label(), volume.fat_type());

    if args.list {
        for entry in volume::list_root(&volume).context("failed to list root directory")? {
            print_entry(&entry);
        }
    }

    if let Some(path) = &args.extract {
        let contents =
            volume::read_file(&volume, path).with_context(|| format!("failed to read {path}"))?;
        match &args.output {
            Some(output) => std::fs::write(output, &contents)
                .with_context(|| format!("failed to write {output:?}"))?,
            None => std::io::stdout().write_all(&contents)?,
        }
    }

    volume.unmount().context("failed to unmount FAT volume")
}

fn print_info(info: &CardInfo) {
    println!("CID:      {}", info.cid);
    println!("RCA:      {:#06X}", info.rca);
    println!(
        "Type:     {} (v{})",
        if info.high_capacity { "SDHC" } else { "SDSC" },
        if info.version2 { "2.00+" } else { "1.x" }
    );
    println!(
        "Capacity: {} blocks ({} MiB)",
        info.blocks,
        info.capacity_bytes() / (1024 * 1024)
    );
    println!("Bus:      {}-bit", if info.wide_bus { 4 } else { 1 });
}

fn print_hex_dump(lba: u64, block: &[u8]) {
    let base = lba * block.len() as u64;
    for (i, line) in block.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  |{}|", base + (i * 16) as u64, hex.join(" "), ascii);
    }
}

fn print_entry(entry: &Entry) {
    if entry.is_dir {
        println!("{:>10}  {}/", "<DIR>", entry.name);
    } else {
        println!("{:>10}  {}", entry.len, entry.name);
    }
}
