pub struct Semaphore {
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Self {
            sem: tokio::sync::Semaphore::new(value),
        }
    }

    /// Takes one token for good; returns `false` if the semaphore was closed.
    pub async fn consume(&self) -> bool {
        match self.sem.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Tops the available tokens back up to `value` (never above it).
    pub fn replenish(&self, value: usize) {
        let curr_permits = self.sem.available_permits();
        if curr_permits >= value {
            return;
        }
        self.sem.add_permits(value - curr_permits);
    }

    pub fn close(&self) {
        self.sem.close();
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}
