// Transport module: proximity radio

pub mod ble;
