use std::env;
use std::process;

use engine_kit::Position;

const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
const DEFAULT_FRAMES: u32 = 4_096;

fn print_status() {
    match engine_kit::control::api::get_status() {
        Some(status) => {
            println!("State       : {:?}", status.state);
            println!("Sample Rate : {} Hz", status.sample_rate);
            println!("Ring Size   : {} frames", status.frames_per_buffer);
            println!(
                "Position    : loop {} frame {}",
                status.position.loop_count, status.position.sample_frame
            );
            println!("Last Wrap   : {} ns", status.last_loop_time_ns);
            println!("Pauses      : {}", status.pause_count);
            println!("Clients     : {}", status.active_clients);
            if let Some(stop) = status.stop_position {
                println!("Stop At     : loop {} frame {}", stop.loop_count, stop.sample_frame);
            }
            println!("Streams:");
            for stream in status.streams {
                let clipped = match stream.clipped_position {
                    Position::At(at) => format!("{}:{}", at.loop_count, at.sample_frame),
                    Position::Unset => "-".to_string(),
                };
                println!(
                    "  [{}] {:?} ch={} | {}ch {}-bit | mixable={} | clients={} | clipped={}",
                    stream.id.0,
                    stream.direction,
                    stream.starting_channel_id,
                    stream.format.num_channels,
                    stream.format.bit_width,
                    if stream.format.is_mixable { "yes" } else { "no" },
                    stream.num_clients,
                    clipped,
                );
            }
        }
        None => {
            eprintln!("enginectl: no active engine");
            process::exit(1);
        }
    }
}

fn main() {
    let handle = engine_kit::engine_kit_engine_create(DEFAULT_SAMPLE_RATE, DEFAULT_FRAMES);
    if handle.is_null() {
        eprintln!("enginectl: failed to create simulated engine");
        process::exit(1);
    }

    let mut args = env::args().skip(1);
    let code = match args.next() {
        Some(arg) => match arg.as_str() {
            "--status" | "-s" => {
                print_status();
                0
            }
            "--help" | "-h" => {
                println!(
                    "Usage: enginectl [--status]\n\nWithout arguments the interactive console launches against a simulated engine."
                );
                0
            }
            other => {
                eprintln!("enginectl: unknown argument '{other}'");
                1
            }
        },
        None => match engine_kit::control::ui::run() {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("enginectl: {err}");
                1
            }
        },
    };

    unsafe { engine_kit::engine_kit_engine_destroy(handle) };
    process::exit(code);
}
