//! Message pack: fan a request out to several chunks and join their
//! responses, grounded in
//! `examples/original_source/libs/grd/include/grd/MessagePack.h`
//! (`scMessagePack`)'s `addMessage`/`isAllHandled`/`getFullResult`
//! contract, plus the auto-split behavior described for `splitParam`.

use nodegrid_address::Address;
use nodegrid_protocol::Envelope;
use nodegrid_shared::Value;
use std::collections::BTreeMap;

/// Partition `items` into at most `chunk_count` contiguous slices of
/// roughly equal size: `N = min(chunk_count, items.len())`,
/// `slice = items.len() / N`, and the final slice absorbs the
/// remainder. `chunk_count == 0` or an empty input is a no-op single
/// chunk.
pub fn split_items<T: Clone>(items: &[T], chunk_count: usize) -> Vec<Vec<T>> {
    let total = items.len();
    if total == 0 || chunk_count <= 1 {
        return vec![items.to_vec()];
    }
    let n = chunk_count.min(total);
    let slice = total / n;
    let mut out = Vec::with_capacity(n);
    let mut idx = 0;
    for i in 0..n {
        let end = if i == n - 1 { total } else { idx + slice };
        out.push(items[idx..end].to_vec());
        idx = end;
    }
    out
}

/// Split `base_params[var_name]` (must be a `Value::List`) into
/// `chunk_count` parameter sets, each a copy of `base_params` with
/// `var_name` replaced by its slice.
pub fn split_params(base_params: &Value, var_name: &str, chunk_count: usize) -> Vec<Value> {
    let Some(list) = base_params.get(var_name).and_then(|v| v.as_list()).map(|s| s.to_vec()) else {
        return vec![base_params.clone()];
    };
    split_items(&list, chunk_count)
        .into_iter()
        .map(|slice| {
            let mut params = base_params.clone();
            params.set(var_name, Value::List(slice));
            params
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct MessagePack {
    pub chunk_count: usize,
    pub split_var_name: Option<String>,
    sent: Vec<i64>,
    received: BTreeMap<i64, Envelope>,
    error_count: usize,
}

impl MessagePack {
    pub fn new() -> Self {
        MessagePack::default()
    }

    pub fn with_chunk_count(mut self, n: usize) -> Self {
        self.chunk_count = n;
        self
    }

    pub fn with_split_var(mut self, name: impl Into<String>) -> Self {
        self.split_var_name = Some(name.into());
        self
    }

    /// Build one request envelope per chunk. If `split_var_name` is set
    /// and `chunk_count > 1`, `params` is auto-split across the
    /// envelopes; otherwise every envelope carries the same params.
    pub fn build_envelopes(
        &self,
        sender: Address,
        receiver: Address,
        command: &str,
        params: &Value,
        request_ids: &[i64],
        timeout_ms: u32,
    ) -> Vec<Envelope> {
        let param_sets = match &self.split_var_name {
            Some(var_name) if self.chunk_count > 1 => split_params(params, var_name, self.chunk_count),
            _ => vec![params.clone(); request_ids.len().max(1)],
        };
        request_ids
            .iter()
            .zip(param_sets)
            .map(|(&request_id, p)| {
                Envelope::request(sender.clone(), receiver.clone(), request_id, command, p, timeout_ms)
            })
            .collect()
    }

    pub fn note_sent(&mut self, request_id: i64) {
        self.sent.push(request_id);
    }

    pub fn note_received(&mut self, response: Envelope) {
        if let Some(status) = response.event.status() {
            if status.is_error() {
                self.error_count += 1;
            }
        }
        self.received.insert(response.request_id(), response);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn is_waiting(&self) -> bool {
        !self.is_all_handled()
    }

    pub fn is_all_handled(&self) -> bool {
        self.sent.iter().all(|id| self.received.contains_key(id))
    }

    pub fn is_result_ok(&self) -> bool {
        self.is_all_handled() && self.error_count == 0
    }

    /// Combine every received response's result into a list, in the
    /// original send order.
    pub fn full_result(&self) -> Value {
        let items: Vec<Value> = self
            .sent
            .iter()
            .filter_map(|id| self.received.get(id))
            .map(|env| match &env.event {
                nodegrid_protocol::Event::Response { result, .. } => result.clone(),
                _ => Value::Null,
            })
            .collect();
        Value::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_min_of_chunk_count_and_len() {
        let items: Vec<i32> = (0..7).collect();
        let chunks = split_items(&items, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 2);
        assert_eq!(chunks[2].len(), 3); // remainder on the final slice
    }

    #[test]
    fn chunk_count_exceeding_items_caps_at_item_count() {
        let items: Vec<i32> = (0..2).collect();
        let chunks = split_items(&items, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1);
        assert_eq!(chunks[1].len(), 1);
    }

    #[test]
    fn zero_or_one_chunk_count_is_a_single_slice() {
        let items: Vec<i32> = (0..5).collect();
        assert_eq!(split_items(&items, 0).len(), 1);
        assert_eq!(split_items(&items, 1).len(), 1);
    }

    #[test]
    fn split_params_replaces_only_named_var() {
        let mut base = Value::map();
        base.set("items", Value::List(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]));
        base.set("mode", Value::from("fast"));

        let sets = split_params(&base, "items", 2);
        assert_eq!(sets.len(), 2);
        for set in &sets {
            assert_eq!(set.get_str_or("mode", ""), "fast");
        }
        let total: usize = sets
            .iter()
            .map(|s| s.get("items").and_then(|v| v.as_list()).map(|l| l.len()).unwrap_or(0))
            .sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn pack_reports_ok_only_once_every_sent_id_has_replied() {
        use nodegrid_address::Address;
        use nodegrid_shared::StatusCode;

        let mut pack = MessagePack::new();
        pack.note_sent(1);
        pack.note_sent(2);
        assert!(pack.is_waiting());

        let r1 = Envelope::request(Address::raw("A"), Address::raw("B"), 1, "x", Value::Null, 0)
            .reply(StatusCode::Ok, Value::from(10i64));
        pack.note_received(r1);
        assert!(!pack.is_all_handled());

        let r2 = Envelope::request(Address::raw("A"), Address::raw("B"), 2, "x", Value::Null, 0)
            .reply(StatusCode::Ok, Value::from(20i64));
        pack.note_received(r2);
        assert!(pack.is_all_handled());
        assert!(pack.is_result_ok());
        assert_eq!(pack.full_result(), Value::List(vec![Value::from(10i64), Value::from(20i64)]));
    }

    #[test]
    fn pack_tracks_error_count_from_error_status() {
        use nodegrid_address::Address;
        use nodegrid_shared::StatusCode;

        let mut pack = MessagePack::new();
        pack.note_sent(1);
        let err = Envelope::request(Address::raw("A"), Address::raw("B"), 1, "x", Value::Null, 0)
            .reply_error(StatusCode::Error, "boom");
        pack.note_received(err);
        assert!(!pack.is_result_ok());
        assert_eq!(pack.error_count(), 1);
    }
}
