use vcoin_primitives::encoding::{decode, DecodeError};
use vcoin_primitives::{Block, BlockHeader, OutPoint, PaymentVote, Transaction, TxIn, TxOut};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }

    fn bytes(&mut self, max_len: usize) -> Vec<u8> {
        let len = self.gen_range(max_len + 1);
        (0..len).map(|_| self.next_u64() as u8).collect()
    }

    fn hash(&mut self) -> [u8; 32] {
        std::array::from_fn(|_| self.next_u64() as u8)
    }
}

fn random_tx(rng: &mut Lcg) -> Transaction {
    let inputs = 1 + rng.gen_range(3);
    let outputs = 1 + rng.gen_range(3);
    Transaction {
        version: 1,
        vin: (0..inputs)
            .map(|_| TxIn {
                prevout: OutPoint::new(rng.hash(), rng.next_u64() as u32),
                script_sig: rng.bytes(300),
                sequence: rng.next_u64() as u32,
            })
            .collect(),
        vout: (0..outputs)
            .map(|_| TxOut::new((rng.next_u64() >> 20) as i64, rng.bytes(300)))
            .collect(),
        lock_time: rng.next_u64() as u32,
    }
}

fn random_block(rng: &mut Lcg) -> Block {
    let tx_count = 1 + rng.gen_range(4);
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: rng.hash(),
            merkle_root: rng.hash(),
            time: rng.next_u64() as u32,
            bits: rng.next_u64() as u32,
            nonce: rng.next_u64() as u32,
        },
        transactions: (0..tx_count).map(|_| random_tx(rng)).collect(),
        votes: (0..rng.gen_range(3))
            .map(|_| PaymentVote {
                height: rng.gen_range(100_000) as i64,
                payee: rng.bytes(25),
                votes: rng.gen_range(10) as i32,
            })
            .collect(),
    }
}

#[test]
fn sizes_track_encodings() {
    let mut rng = Lcg::new(7);
    for _ in 0..64 {
        let block = random_block(&mut rng);
        let bytes = block.consensus_encode_to_vec();
        assert_eq!(block.serialized_size(), bytes.len());
        for tx in &block.transactions {
            assert_eq!(tx.serialized_size(), tx.consensus_encode_to_vec().len());
        }
    }
}

#[test]
fn every_truncation_fails_to_decode() {
    let mut rng = Lcg::new(11);
    for _ in 0..8 {
        let tx = random_tx(&mut rng);
        let bytes = tx.consensus_encode_to_vec();
        for cut in 0..bytes.len() {
            assert!(decode::<Transaction>(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut rng = Lcg::new(3);
    let block = random_block(&mut rng);
    let mut bytes = block.consensus_encode_to_vec();
    bytes.push(0);
    assert_eq!(decode::<Block>(&bytes), Err(DecodeError::TrailingBytes));
}
