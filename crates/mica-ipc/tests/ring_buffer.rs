use std::collections::VecDeque;
use std::sync::Arc;

use mica_ipc::layout::ring_ctrl;
use mica_ipc::ring::{max_payload_len_for_capacity, MsgRing, PopError, PushError};
use mica_ipc::shmem::SharedMemory;

struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        ((x.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    fn gen_range(&mut self, max_exclusive: u32) -> u32 {
        if max_exclusive == 0 {
            return 0;
        }
        self.next_u32() % max_exclusive
    }

    fn fill_bytes(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b = (self.next_u32() & 0xFF) as u8;
        }
    }
}

fn shared_ring(capacity: u32) -> Arc<MsgRing> {
    let mem = SharedMemory::alloc(ring_ctrl::BYTES + capacity as usize).unwrap();
    Arc::new(MsgRing::init(mem, 0, ring_ctrl::BYTES, capacity))
}

fn pop_spinning(ring: &MsgRing) -> Vec<u8> {
    loop {
        match ring.try_pop() {
            Ok(v) => return v,
            Err(PopError::Empty) => std::hint::spin_loop(),
            Err(PopError::Corrupt) => panic!("ring corruption"),
        }
    }
}

fn push_spinning(ring: &MsgRing, payload: &[u8]) {
    loop {
        match ring.try_push(payload) {
            Ok(()) => return,
            Err(PushError::Full) => std::hint::spin_loop(),
            Err(PushError::TooLarge) => panic!("payload too large for ring"),
        }
    }
}

#[test]
fn msg_ring_single_thread_fuzz() {
    // Tiny capacity to force wraparound and full-ring behaviour.
    let ring = shared_ring(256);
    let mut model: VecDeque<Vec<u8>> = VecDeque::new();

    let mut rng = Rng::new(0x1234_5678_9ABC_DEF0);
    for _ in 0..50_000 {
        match rng.gen_range(3) {
            0 => {
                let len = rng.gen_range(64) as usize;
                let mut msg = vec![0u8; len];
                rng.fill_bytes(&mut msg);
                match ring.try_push(&msg) {
                    Ok(()) => model.push_back(msg),
                    Err(PushError::Full) => {}
                    Err(PushError::TooLarge) => panic!("unexpected TooLarge"),
                }
            }
            1 => match ring.try_pop() {
                Ok(v) => {
                    let expected = model.pop_front().expect("model has data");
                    assert_eq!(v, expected);
                }
                Err(PopError::Empty) => assert!(model.is_empty()),
                Err(PopError::Corrupt) => panic!("corrupt"),
            },
            _ => {
                // Push then pop, to exercise immediate wrap-marker cases.
                let len = rng.gen_range(32) as usize;
                let mut msg = vec![0u8; len];
                rng.fill_bytes(&mut msg);
                if ring.try_push(&msg).is_ok() {
                    model.push_back(msg);
                }
                if let Ok(v) = ring.try_pop() {
                    let expected = model.pop_front().expect("model has data");
                    assert_eq!(v, expected);
                }
            }
        }
    }

    while let Ok(v) = ring.try_pop() {
        let expected = model.pop_front().expect("model has data");
        assert_eq!(v, expected);
    }
    assert!(model.is_empty());
}

#[test]
fn msg_ring_spsc_concurrent() {
    let ring = shared_ring(512);
    let producer = ring.clone();
    let consumer = ring.clone();

    const N: u32 = 100_000;

    let t_prod = std::thread::spawn(move || {
        let mut buf = [0u8; 4];
        for i in 0..N {
            buf.copy_from_slice(&i.to_le_bytes());
            push_spinning(&producer, &buf);
        }
    });

    let t_cons = std::thread::spawn(move || {
        for i in 0..N {
            let msg = pop_spinning(&consumer);
            let got = u32::from_le_bytes(msg[..4].try_into().unwrap());
            assert_eq!(got, i);
        }
    });

    t_prod.join().unwrap();
    t_cons.join().unwrap();
    assert!(ring.is_empty());
}

#[test]
fn msg_ring_mpsc_concurrent() {
    let ring = shared_ring(1024);

    // Two producers are enough to exercise the reservation/commit paths
    // without flooding constrained CI machines with threads.
    const PRODUCERS: usize = 2;
    const PER_PRODUCER: u32 = 50_000;

    let mut handles = Vec::new();
    for pid in 0..PRODUCERS {
        let ring = ring.clone();
        handles.push(std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            for seq in 0..PER_PRODUCER {
                buf[..4].copy_from_slice(&(pid as u32).to_le_bytes());
                buf[4..].copy_from_slice(&seq.to_le_bytes());
                push_spinning(&ring, &buf);
            }
        }));
    }

    let total = PRODUCERS as u32 * PER_PRODUCER;
    let mut seen = vec![vec![false; PER_PRODUCER as usize]; PRODUCERS];

    for _ in 0..total {
        let msg = pop_spinning(&ring);
        let pid = u32::from_le_bytes(msg[..4].try_into().unwrap()) as usize;
        let seq = u32::from_le_bytes(msg[4..8].try_into().unwrap()) as usize;
        assert!(pid < PRODUCERS);
        assert!(seq < PER_PRODUCER as usize);
        assert!(!seen[pid][seq], "duplicate delivery");
        seen[pid][seq] = true;
    }

    for h in handles {
        h.join().unwrap();
    }

    for (pid, rows) in seen.iter().enumerate() {
        for (seq, v) in rows.iter().enumerate() {
            assert!(*v, "missing pid={pid} seq={seq}");
        }
    }
    assert!(ring.is_empty());
}

#[test]
fn msg_ring_rejects_too_large_record() {
    let ring = shared_ring(64);
    let payload = vec![0u8; 10_000];
    assert_eq!(ring.try_push(&payload), Err(PushError::TooLarge));
    assert!(10_000 > max_payload_len_for_capacity(ring.capacity_bytes()));
}

#[test]
fn msg_ring_zero_length_records_survive_wrap() {
    let ring = shared_ring(64);
    // Interleave empty and non-empty payloads long enough to wrap several
    // times; empty records must not be confused with padding.
    for round in 0..100u8 {
        ring.try_push(&[]).unwrap();
        ring.try_push(&[round; 24]).unwrap();
        assert_eq!(ring.try_pop().unwrap(), Vec::<u8>::new());
        assert_eq!(ring.try_pop().unwrap(), vec![round; 24]);
    }
    assert!(ring.is_empty());
}
