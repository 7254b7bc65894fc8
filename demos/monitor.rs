use std::env;
use std::time::Duration;

use honeywell_home::{ApiClient, Thermostat};

#[tokio::main]
async fn main() -> honeywell_home::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let device_id = args.get(1).expect("usage: monitor <device-id> <location-id>");
    let location_id = args.get(2).expect("usage: monitor <device-id> <location-id>");
    let token = env::var("HONEYWELL_TOKEN").expect("HONEYWELL_TOKEN must be set");

    let mut api = ApiClient::new(token);
    if let Ok(key) = env::var("HONEYWELL_API_KEY") {
        api = api.with_api_key(key);
    }

    println!("Fetching {device_id}...");
    let device = api.get_device(device_id, location_id).await?;
    println!(
        "{} | {:.1} degrees indoor | mode: {} | fan: {}",
        device.name,
        device.indoor_temperature,
        device.changeable_values.mode,
        if device.has_fan() { "yes" } else { "no" },
    );

    let thermostat = Thermostat::builder(api, device, location_id.clone())
        .refresh_interval(Duration::from_secs(30))
        .on_update(|characteristic, update| {
            println!("{characteristic:?} -> {update:?}");
        })
        .on_token_refresh(|| {
            eprintln!("Request failed; access token may need renewing");
        })
        .build();

    println!("Polling for updates...");
    thermostat.run().await;
    Ok(())
}
