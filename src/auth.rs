/// Secret shared with the identity gateway in front of this server. Every
/// connection proves it with its `hello` frame before sending requests.
#[derive(Clone)]
pub struct SharedSecret {
    secret: String,
}

impl SharedSecret {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Length-independent comparison of the presented secret.
    pub fn verify(&self, presented: &str) -> bool {
        let a = self.secret.as_bytes();
        let b = presented.as_bytes();
        let mut diff = a.len() ^ b.len();
        for i in 0..a.len().max(b.len()) {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            diff |= (x ^ y) as usize;
        }
        diff == 0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(***)")
    }
}
