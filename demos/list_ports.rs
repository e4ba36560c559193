// Lists the serial ports instruments can be connected to.

use irrad_daq::Connector;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let ports = Connector::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    println!("Found {} port(s):", ports.len());
    for (i, port) in ports.iter().enumerate() {
        println!("  {}. {}", i + 1, port.description());
        if let Some(serial) = &port.serial_number {
            println!("     serial number {serial}");
        }
    }
    Ok(())
}
