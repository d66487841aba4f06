use base64;
use clap::{App, Arg};
use rand::RngCore;

const KEY_LEN: usize = 128;

fn main() {
    let matches = App::new("Key Generator")
        .version("0.1.0")
        .about("Generates pre-shared hub key entries for the seed file.")
        .arg(
            Arg::with_name("NKEYS")
                .help("Number of new keys to generate")
                .required(true),
        )
        .arg(
            Arg::with_name("START_IDX")
                .help("Key index of the first generated entry")
                .required(false),
        )
        .get_matches();

    let key_count: u16 = matches
        .value_of("NKEYS")
        .unwrap()
        .parse()
        .expect("Key count must be a valid integer");

    let start_idx: u16 = matches
        .value_of("START_IDX")
        .unwrap_or("1")
        .parse()
        .expect("Start index must be a valid integer");

    let mut rng = rand::thread_rng();

    for i in 0..key_count {
        let mut key = [0u8; KEY_LEN];
        rng.fill_bytes(&mut key);

        // One TOML table per key, ready to paste into the seed file. The
        // same base64 string goes into the matching ship's gate_key.
        println!("[[ship_keys]]");
        println!("idx = {}", start_idx + i);
        println!("rc4key = \"{}\"", base64::encode(&key[..]));
        println!("main_menu = true");
        println!();
    }
}
