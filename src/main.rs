//! ov7251-bringup: attach to an InnoMaker OV7251 module and stream until Ctrl-C.

use inno_ov7251::logging;
use inno_ov7251::traits::Result;
use inno_ov7251::{DriverConfig, DriverError, FixedClock, FormatWhich, Ov7251, SensorSubdevice};
use linux_embedded_hal::I2cdev;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = DriverConfig::load()?;
    logging::init(&config.logging)?;

    let bus = I2cdev::new(&config.bus)
        .map_err(|err| DriverError::Config(format!("cannot open {}: {err}", config.bus)))?;
    let device = Ov7251::attach(bus, FixedClock, &config).await?;

    if let Some(identity) = device.identity() {
        println!("Module: {} {}", identity.manufacturer, identity.sensor_type);
        println!(
            "Module id: 0x{:04x} rev {}",
            identity.module_id, identity.module_revision
        );
    }
    if let Some(sensor) = device.sensor_identity() {
        println!("Chip id: 0x{:04x} lot {}", sensor.chip_id, sensor.lot);
    }

    let format = device.format(FormatWhich::Active);
    println!(
        "Mode {}: {}x{} {:?} ({}), {} fps, pixel rate {}",
        device.mode().index,
        format.width,
        format.height,
        format.pixel_format,
        format.pixel_format.fourcc(),
        device.mode().max_fps,
        device.pixel_rate()
    );

    device.power(true).await?;
    device.stream_enable(true).await?;
    println!("Streaming, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| DriverError::Config(format!("signal handler: {err}")))?;

    device.stream_enable(false).await?;
    device.power(false).await?;
    device.detach().await;
    Ok(())
}
