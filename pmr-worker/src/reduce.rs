use anyhow::{bail, Context, Error};
use tracing::info;

use common::{Code, Messenger, Phase, Slot};

use crate::core::Worker;
use crate::sandbox::Sandbox;

pub const REDUCE_SOURCE: &str = "fred.py";

/// The keys assigned to this peer, as a JSON array.
pub const KEYS_FILE: &str = "reduce_keys.json";

/// `{key: result}` for every assigned key found in the map output.
pub const OUTPUT_FILE: &str = "reduce_output.json";

const REDUCE_SCRIPT: &str = r#"
import json
import os

if os.path.exists('stderr.json'):
    os.remove('stderr.json')

print('reduce run')

try:
    namespace = {}
    with open('fred.py') as source:
        exec(source.read(), namespace)
    fred = namespace['fred']

    groups = {}
    if os.path.exists('map_output.json'):
        with open('map_output.json') as f:
            groups = json.load(f)

    with open('reduce_keys.json') as f:
        keys = json.load(f)

    results = {}
    for key in keys:
        if key not in groups:
            continue
        results[key] = fred(key, groups[key])
        print(str(key) + ' ' + str(results[key]))
        print('__REDUCE_MARKER__')

    with open('reduce_output.json', 'w') as f:
        json.dump(results, f)
except Exception as e:
    with open('stderr.json', 'w') as f:
        json.dump({'reduceCode': str(e)}, f)
"#;

/// The script reducing the map output of every key in [`KEYS_FILE`].
///
/// A fixed `reduce run` line comes first, so the run's output never starts
/// with text that overlaps the tail of the previous run. Then one
/// `key result` line and one reduce marker are printed per key.
pub fn reduce_script() -> String {
    REDUCE_SCRIPT.replace("__REDUCE_MARKER__", Phase::Reduce.marker())
}

/// Reduce the keys the coordinator assigned to this peer.
///
/// Returns the JSON object written to [`OUTPUT_FILE`], or `None` when no
/// keys are assigned.
pub async fn perform_reduce<S, M>(worker: &Worker<S, M>, code: &Code) -> Result<Option<String>, Error>
where
    S: Sandbox + 'static,
    M: Messenger + 'static,
{
    let keys: Vec<String> = worker
        .store()
        .read(|state| state.reduce_keys.iter().cloned().collect());
    if keys.is_empty() {
        info!("no reduce keys assigned, nothing to reduce");
        return Ok(None);
    }

    info!("Starting reduce task over {} keys", keys.len());

    worker.write_file(REDUCE_SOURCE, &code.reduce_code).await?;
    worker
        .write_file(KEYS_FILE, &serde_json::to_string(&keys)?)
        .await?;
    worker
        .execute(&reduce_script())
        .await
        .context("reduce run failed")?;

    let errors = worker.read_errors().await?;
    let error = errors.slot(Slot::Reduce);
    if !error.is_empty() {
        bail!("reduce code failed: {error}");
    }

    let output = worker.runner().read_file_or(OUTPUT_FILE, "{}").await?;
    Ok(Some(output))
}
