//! The polling collaborator's exact call sequence, end to end.
//!
//! The cycle-count logger never uses the control command: it drives a
//! search with seek/write, busy-polls the done flag with seek/read, then
//! walks the cycle-count pair with one seek and two reads (cursor
//! auto-advance). This test replays that sequence against the simulator.

use litefury_driver::sim::{next_prime, simulated_device};
use litefury_driver::{DeviceFile, Whence};
use litefury_chip::regs;

fn read_u32(file: &mut DeviceFile) -> u32 {
    let mut buf = [0u8; 4];
    let copied = file.read(&mut buf).expect("register read");
    assert_eq!(copied, 4);
    u32::from_ne_bytes(buf)
}

#[test]
fn polling_search_over_the_cursor_surface() {
    let (device, _sim) = simulated_device();
    let mut file = DeviceFile::open(device);
    let seed = 840_000u32;

    // Clear: seek once, two back-to-back writes (cursor walks 0 → 4).
    file.seek(regs::START_FLAG as i64, Whence::Set);
    file.write(&0u32.to_ne_bytes()).expect("clear flag");
    file.write(&0u32.to_ne_bytes()).expect("clear seed");

    // Start: seed first, trigger second.
    file.seek(regs::START_NUMBER as i64, Whence::Set);
    file.write(&seed.to_ne_bytes()).expect("seed");
    file.seek(regs::START_FLAG as i64, Whence::Set);
    file.write(&regs::START.to_ne_bytes()).expect("trigger");

    // Poll until done (the simulator completes on the trigger edge, so
    // one iteration suffices; a real board loops here).
    loop {
        file.seek(regs::DONE_FLAG as i64, Whence::Set);
        if read_u32(&mut file) == regs::DONE {
            break;
        }
    }

    // One seek, two reads: HIGH then LOW via cursor auto-advance.
    file.seek(regs::CYCLE_COUNT_HIGH as i64, Whence::Set);
    let high = read_u32(&mut file);
    let low = read_u32(&mut file);
    let cycles = (u64::from(high) << 32) | u64::from(low);

    file.seek(regs::PRIME_NUMBER as i64, Whence::Set);
    let prime = read_u32(&mut file);

    assert_eq!(prime, next_prime(seed));
    assert!(cycles > 0, "a completed search always costs cycles");
}
