//! Redis-backed history store shared by every process using the same server.
//!
//! Histories are stored as JSON arrays of floats under the throttle key, with
//! the window length as a millisecond expiry.

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{HistoryStore, StoreError};

/// Swap the stored history only if it still holds the expected timestamps.
/// Missing or unreadable values compare equal to the empty history, matching
/// what `get` reports for them.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local function decode(raw)
  if not raw then return {} end
  local ok, value = pcall(cjson.decode, raw)
  if not ok or type(value) ~= 'table' then return {} end
  for i = 1, #value do
    if type(value[i]) ~= 'number' then return {} end
  end
  return value
end

local current = decode(redis.call('GET', KEYS[1]))
local expected = cjson.decode(ARGV[1])
if #current ~= #expected then return 0 end
for i = 1, #expected do
  if current[i] ~= expected[i] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// [`HistoryStore`] on top of a multiplexed Redis connection.
///
/// The connection is opened once (see [`RedisHistoryStore::connect`]) and
/// cloned cheaply per command.
#[derive(Clone)]
pub struct RedisHistoryStore {
    connection: MultiplexedConnection,
    cas_script: Script,
}

impl RedisHistoryStore {
    /// Open a connection to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis history store");
        Ok(Self::from_connection(connection))
    }

    /// Wrap a connection the hosting application already manages.
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            cas_script: Script::new(COMPARE_AND_SET_SCRIPT),
        }
    }

    /// Round-trip a `PING` to check connectivity.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis health check passed");
        Ok(())
    }
}

impl std::fmt::Debug for RedisHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHistoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn get(&self, key: &str) -> Result<Vec<f64>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<Vec<u8>> = conn.get(key).await?;
        Ok(raw.map(|bytes| decode_history(key, &bytes)).unwrap_or_default())
    }

    async fn set(&self, key: &str, history: &[f64], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.pset_ex(key, encode_history(history), ttl_millis(ttl)).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[f64],
        history: &[f64],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(encode_history(expected))
            .arg(encode_history(history))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

fn encode_history(history: &[f64]) -> String {
    // A slice of finite floats always serializes.
    serde_json::to_string(history).unwrap_or_else(|_| "[]".to_string())
}

fn decode_history(key: &str, bytes: &[u8]) -> Vec<f64> {
    match serde_json::from_slice::<Vec<f64>>(bytes) {
        Ok(history) => history,
        Err(e) => {
            warn!(key = %key, error = %e, "Ignoring unreadable throttle history");
            Vec::new()
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_encoding_is_a_json_array() {
        assert_eq!(encode_history(&[]), "[]");
        assert_eq!(encode_history(&[1700000000.25, 1699999990.5]), "[1700000000.25,1699999990.5]");
    }

    #[test]
    fn test_decode_round_trips_timestamps() {
        let history = vec![1700000123.456789, 1700000001.0];
        let decoded = decode_history("k", encode_history(&history).as_bytes());
        assert_eq!(decoded, history);
    }

    #[test]
    fn test_corrupt_values_decode_as_empty() {
        assert!(decode_history("k", b"not json").is_empty());
        assert!(decode_history("k", b"{\"a\": 1}").is_empty());
        assert!(decode_history("k", b"[1.0, \"x\"]").is_empty());
        assert!(decode_history("k", &[0x80, 0x04, 0x95]).is_empty());
    }

    #[test]
    fn test_ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    /// Tests below need a live server: `REDIS_URL=redis://... cargo test -- --ignored`.
    mod server {
        use super::super::*;
        use crate::store::HistoryStore;
        use crate::throttle::{Consistency, ManualClock, Throttle};
        use std::sync::Arc;

        const TTL: Duration = Duration::from_secs(60);

        async fn store() -> RedisHistoryStore {
            let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
            RedisHistoryStore::connect(&url).await.unwrap()
        }

        fn unique(name: &str) -> String {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            format!("slidegate_test_{}_{}_{}", name, std::process::id(), nanos)
        }

        #[tokio::test]
        #[ignore]
        async fn test_ping() {
            store().await.ping().await.unwrap();
        }

        #[tokio::test]
        #[ignore]
        async fn test_missing_key_is_empty() {
            let store = store().await;
            assert!(store.get(&unique("missing")).await.unwrap().is_empty());
        }

        #[tokio::test]
        #[ignore]
        async fn test_set_get_and_expiry() {
            let store = store().await;
            let key = unique("expiry");

            store.set(&key, &[1700000001.5, 1700000000.25], Duration::from_millis(200)).await.unwrap();
            assert_eq!(store.get(&key).await.unwrap(), vec![1700000001.5, 1700000000.25]);

            tokio::time::sleep(Duration::from_millis(400)).await;
            assert!(store.get(&key).await.unwrap().is_empty());
        }

        #[tokio::test]
        #[ignore]
        async fn test_compare_and_set() {
            let store = store().await;
            let key = unique("cas");

            assert!(!store.compare_and_set(&key, &[1.0], &[2.0], TTL).await.unwrap());
            assert!(store.compare_and_set(&key, &[], &[1.0], TTL).await.unwrap());
            assert!(!store.compare_and_set(&key, &[], &[3.0], TTL).await.unwrap());
            assert!(store.compare_and_set(&key, &[1.0], &[2.0, 1.0], TTL).await.unwrap());
            assert_eq!(store.get(&key).await.unwrap(), vec![2.0, 1.0]);
        }

        #[tokio::test]
        #[ignore]
        async fn test_compare_and_set_over_unreadable_value() {
            let store = store().await;
            let key = unique("corrupt");

            let mut conn = store.connection.clone();
            let _: () = conn.pset_ex(&key, "not json", 60_000u64).await.unwrap();
            assert!(store.get(&key).await.unwrap().is_empty());

            assert!(store.compare_and_set(&key, &[], &[5.0], TTL).await.unwrap());
            assert_eq!(store.get(&key).await.unwrap(), vec![5.0]);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        #[ignore]
        async fn test_atomic_throttle_never_over_admits() {
            let clock = ManualClock::new(1_700_000_000.0);
            let throttle = Arc::new(
                Throttle::builder()
                    .scope(unique("scope"))
                    .rate("5/m")
                    .store(Arc::new(store().await))
                    .clock(Arc::new(clock))
                    .consistency(Consistency::Atomic)
                    .max_retries(64)
                    .build()
                    .unwrap(),
            );

            let mut tasks = tokio::task::JoinSet::new();
            for _ in 0..32 {
                let throttle = throttle.clone();
                tasks.spawn(async move { throttle.check_and_record("hot").await.unwrap().admitted });
            }

            let mut admitted = 0;
            while let Some(result) = tasks.join_next().await {
                if result.unwrap() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 5);
        }
    }
}
