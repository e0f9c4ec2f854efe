use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use tokio::sync::watch;
use tracing::{info, warn};

use common::{Code, Messenger, Phase, Slot};

use crate::core::Worker;
use crate::sandbox::Sandbox;
use crate::session::RoomSession;

/// Converted records of the input file being mapped.
pub const INPUT_FILE: &str = "input.txt";
pub const MAP_SOURCE: &str = "fmap.py";
pub const COMBINE_SOURCE: &str = "fcomb.py";

/// Grouped map output, `{key: [values]}`, accumulated across input files.
pub const INTERMEDIATE_FILE: &str = "map_output.json";

const LOADER: &str = r#"
import json
import os

def load(path, name):
    namespace = {}
    with open(path) as source:
        exec(source.read(), namespace)
    return namespace[name]

if os.path.exists('stderr.json'):
    os.remove('stderr.json')
"#;

const MAP_BODY: &str = r#"
slot = 'mapCode'
try:
    fmap = load('fmap.py', 'fmap')

    groups = {}
    if os.path.exists('map_output.json'):
        with open('map_output.json') as f:
            groups = json.load(f)

    records = 0
    with open('input.txt') as f:
        for line in f:
            line = line.strip()
            if not line:
                continue
            records += 1
            for key, value in fmap(line) or []:
                groups.setdefault(str(key), []).append(value)
__COMBINE__
    with open('map_output.json', 'w') as f:
        json.dump(groups, f)

    print('map batch __BATCH__: ' + str(records) + ' records')
    print('__MAP_MARKER__')
__COMBINE_MARKER__
except Exception as e:
    with open('stderr.json', 'w') as f:
        json.dump({slot: str(e)}, f)
"#;

const COMBINE_STEP: &str = r#"
    slot = 'combinerCode'
    fcomb = load('fcomb.py', 'fcomb')
    groups = dict((key, [fcomb(key, values)]) for key, values in groups.items())
"#;

/// The script mapping [`INPUT_FILE`] through `fmap` (and `fcomb`).
///
/// `batch` tags the run's output so that consecutive batches never print
/// identical text.
pub fn map_script(batch: usize, with_combiner: bool) -> String {
    let (combine, combine_marker) = if with_combiner {
        (
            COMBINE_STEP.to_string(),
            format!("    print('{}')", Phase::Combine.marker()),
        )
    } else {
        (String::new(), String::new())
    };

    let body = MAP_BODY
        .replace("__COMBINE__", &combine)
        .replace("__COMBINE_MARKER__", &combine_marker)
        .replace("__BATCH__", &batch.to_string())
        .replace("__MAP_MARKER__", Phase::Map.marker());

    format!("{LOADER}{body}")
}

/// Map every input file in the sandbox, one file per run.
///
/// Before each run the session is told how many files remain after it, so
/// the final run's markers are recognised as the end of the map phase.
pub async fn perform_map<S, M>(
    worker: &Worker<S, M>,
    session: &watch::Sender<RoomSession>,
    code: &Code,
    inputs: &[PathBuf],
) -> Result<(), Error>
where
    S: Sandbox + 'static,
    M: Messenger + 'static,
{
    if inputs.is_empty() {
        warn!("no input files to map");
        return Ok(());
    }

    info!("Starting map task over {} input files", inputs.len());

    worker.write_file(MAP_SOURCE, &code.map_code).await?;
    let with_combiner = !code.combiner_code.is_empty();
    if with_combiner {
        worker
            .write_file(COMBINE_SOURCE, &code.combiner_code)
            .await?;
    }

    for (batch, path) in inputs.iter().enumerate() {
        let records = ingest::convert_file(path)?;
        info!("mapping {} ({} bytes)", path.display(), records.len());

        session.send_modify(|session| session.pending_files = inputs.len() - batch - 1);
        worker.write_file(INPUT_FILE, &records).await?;
        worker
            .execute(&map_script(batch, with_combiner))
            .await
            .with_context(|| format!("map run failed on {}", path.display()))?;

        let errors = worker.read_errors().await?;
        for slot in [Slot::Map, Slot::Combiner] {
            let error = errors.slot(slot);
            if !error.is_empty() {
                bail!("{slot} code failed on {}: {error}", path.display());
            }
        }
    }

    Ok(())
}
