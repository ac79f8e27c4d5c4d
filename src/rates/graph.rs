use crate::core::currency::CurrencyCode;
use crate::rates::series::{RateError, RateSeries};
use chrono::{DateTime, Duration, Utc};
use log::warn;
use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

/// Default distance between a requested instant and the nearest sample
/// for an edge to count as covered.
pub const DEFAULT_TOLERANCE_HOURS: i64 = 24;

/// One hop of a resolved conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    /// Index of the series used, in insertion order.
    pub series: usize,
    /// `true` when the hop goes from the series' quote to its base, so its
    /// rate enters the product inverted.
    pub inverted: bool,
}

/// A graph of currencies connected by rate series.
///
/// Every series is an undirected edge between its base and quote. A rate
/// between two currencies is the product of the rates along the shortest
/// path connecting them, each hop inverted when walked against its
/// series' direction. Several series for the same pair are kept as
/// parallel edges.
///
/// # Examples
///
/// ```
/// use ccgains::core::currency::{CurrencyCode, CurrencyPair};
/// use ccgains::rates::graph::RateGraph;
/// use ccgains::rates::series::RateSeries;
/// use chrono::{TimeZone, Utc};
/// use rust_decimal_macros::dec;
///
/// let t = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
/// let mut graph = RateGraph::default();
/// graph.add_series(
///     RateSeries::with_samples(CurrencyPair::new("XMR", "BTC"), vec![(t, dec!(0.01))]).unwrap(),
/// );
/// graph.add_series(
///     RateSeries::with_samples(CurrencyPair::new("BTC", "EUR"), vec![(t, dec!(1000))]).unwrap(),
/// );
///
/// let xmr = CurrencyCode::new("XMR");
/// let eur = CurrencyCode::new("EUR");
/// assert_eq!(graph.rate(&xmr, &eur, t).unwrap(), dec!(10));
/// ```
#[derive(Debug)]
pub struct RateGraph {
    graph: UnGraph<CurrencyCode, usize>,
    nodes: HashMap<CurrencyCode, NodeIndex>,
    series: Vec<RateSeries>,
    tolerance: Duration,
}

impl RateGraph {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            graph: UnGraph::new_undirected(),
            nodes: HashMap::new(),
            series: Vec::new(),
            tolerance,
        }
    }

    /// Build a graph from a fixed set of series.
    pub fn from_series(series: impl IntoIterator<Item = RateSeries>, tolerance: Duration) -> Self {
        let mut graph = Self::new(tolerance);
        for s in series {
            graph.add_series(s);
        }
        graph
    }

    fn node(&mut self, currency: &CurrencyCode) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(currency) {
            return idx;
        }
        let idx = self.graph.add_node(currency.clone());
        self.nodes.insert(currency.clone(), idx);
        idx
    }

    /// Add a series as a new edge. Returns its index.
    pub fn add_series(&mut self, series: RateSeries) -> usize {
        let pair = series.pair().clone();
        debug_assert_ne!(pair.base, pair.quote, "a series must connect two currencies");
        let index = self.series.len();
        let a = self.node(&pair.base);
        let b = self.node(&pair.quote);
        self.graph.add_edge(a, b, index);
        self.series.push(series);
        index
    }

    pub fn series(&self, index: usize) -> Option<&RateSeries> {
        self.series.get(index)
    }

    pub fn series_mut(&mut self, index: usize) -> Option<&mut RateSeries> {
        self.series.get_mut(index)
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn currencies(&self) -> impl Iterator<Item = &CurrencyCode> {
        self.graph.node_weights()
    }

    pub fn contains(&self, currency: &CurrencyCode) -> bool {
        self.nodes.contains_key(currency)
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Resolve the route used to convert `from` into `to` at `time`.
    ///
    /// Edges with data near `time` are preferred (fetching through a
    /// series' source when one is attached). If those don't connect the
    /// two currencies, any path is accepted and its rates come from the
    /// nearest available samples.
    pub fn path(
        &mut self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        time: DateTime<Utc>,
    ) -> Result<Vec<PathStep>, RateError> {
        if from == to {
            return Ok(Vec::new());
        }
        let unrelated = || RateError::UnrelatedCurrencies {
            from: from.clone(),
            to: to.clone(),
        };
        let start = *self.nodes.get(from).ok_or_else(unrelated)?;
        let goal = *self.nodes.get(to).ok_or_else(unrelated)?;

        let tolerance = self.tolerance;
        let series = &mut self.series;
        let mut coverage: HashMap<usize, bool> = HashMap::new();
        let covered = shortest_path(&self.graph, start, goal, |idx| {
            *coverage
                .entry(idx)
                .or_insert_with(|| series[idx].ensure_coverage(time, tolerance))
        });

        let edges = match covered {
            Some(edges) => edges,
            None => {
                let edges = shortest_path(&self.graph, start, goal, |_| true).ok_or_else(unrelated)?;
                warn!(
                    "no rates near {} connect {} and {}, falling back to nearest samples",
                    time, from, to
                );
                edges
            }
        };

        let mut at = start;
        let mut steps = Vec::with_capacity(edges.len());
        for edge in edges {
            let idx = self.graph[edge];
            let inverted = self.series[idx].pair().base != self.graph[at];
            at = match self.graph.edge_endpoints(edge) {
                Some((a, b)) if a == at => b,
                Some((a, _)) => a,
                None => return Err(unrelated()),
            };
            steps.push(PathStep {
                series: idx,
                inverted,
            });
        }
        Ok(steps)
    }

    /// Units of `to` per one unit of `from` at `time`.
    pub fn rate(
        &mut self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        time: DateTime<Utc>,
    ) -> Result<Decimal, RateError> {
        let steps = self.path(from, to, time)?;
        // Keep numerator and denominator apart so that inverse paths
        // yield exact reciprocals.
        let mut numerator = Decimal::ONE;
        let mut denominator = Decimal::ONE;
        for step in steps {
            let rate = self.series[step.series].lookup(time)?;
            if step.inverted {
                denominator *= rate;
            } else {
                numerator *= rate;
            }
        }
        Ok(numerator / denominator)
    }

    /// Value of `amount` units of `from`, expressed in `to`.
    pub fn convert(
        &mut self,
        amount: Decimal,
        from: &CurrencyCode,
        to: &CurrencyCode,
        time: DateTime<Utc>,
    ) -> Result<Decimal, RateError> {
        Ok(amount * self.rate(from, to, time)?)
    }
}

impl Default for RateGraph {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_TOLERANCE_HOURS))
    }
}

/// Breadth-first search restricted to edges accepted by `usable`.
///
/// Neighbours are visited in edge insertion order, so among paths of
/// equal length the one over earlier-added series wins.
fn shortest_path(
    graph: &UnGraph<CurrencyCode, usize>,
    start: NodeIndex,
    goal: NodeIndex,
    mut usable: impl FnMut(usize) -> bool,
) -> Option<Vec<EdgeIndex>> {
    let mut came_from: HashMap<NodeIndex, (NodeIndex, EdgeIndex)> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        if node == goal {
            break;
        }
        let mut edges: Vec<_> = graph.edges(node).collect();
        edges.sort_by_key(|e| e.id());
        for edge in edges {
            let next = if edge.source() == node {
                edge.target()
            } else {
                edge.source()
            };
            if next == start || came_from.contains_key(&next) {
                continue;
            }
            if !usable(*edge.weight()) {
                continue;
            }
            came_from.insert(next, (node, edge.id()));
            queue.push_back(next);
        }
    }

    if !came_from.contains_key(&goal) {
        return None;
    }
    let mut path = Vec::new();
    let mut at = goal;
    while at != start {
        let (prev, edge) = came_from.get(&at)?;
        path.push(*edge);
        at = *prev;
    }
    path.reverse();
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::CurrencyPair;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 3, 1, 12, 0, 0).unwrap()
    }

    fn series(base: &str, quote: &str, rate: Decimal) -> RateSeries {
        RateSeries::with_samples(CurrencyPair::new(base, quote), vec![(t0(), rate)]).unwrap()
    }

    fn cur(code: &str) -> CurrencyCode {
        CurrencyCode::new(code)
    }

    #[test]
    fn test_two_hop_composition_and_inverse() {
        let mut graph = RateGraph::default();
        graph.add_series(series("A", "B", dec!(2)));
        graph.add_series(series("B", "C", dec!(3)));

        assert_eq!(graph.rate(&cur("A"), &cur("C"), t0()).unwrap(), dec!(6));
        assert_eq!(
            graph.rate(&cur("C"), &cur("A"), t0()).unwrap(),
            Decimal::ONE / dec!(6)
        );
        assert_eq!(graph.rate(&cur("B"), &cur("A"), t0()).unwrap(), dec!(0.5));
    }

    #[test]
    fn test_same_currency_is_one() {
        let mut graph = RateGraph::default();
        assert_eq!(graph.rate(&cur("EUR"), &cur("EUR"), t0()).unwrap(), Decimal::ONE);
    }

    #[test]
    fn test_unknown_and_disconnected_currencies() {
        let mut graph = RateGraph::default();
        graph.add_series(series("A", "B", dec!(2)));
        graph.add_series(series("C", "D", dec!(2)));

        assert!(matches!(
            graph.rate(&cur("A"), &cur("Z"), t0()),
            Err(RateError::UnrelatedCurrencies { .. })
        ));
        assert!(matches!(
            graph.rate(&cur("A"), &cur("D"), t0()),
            Err(RateError::UnrelatedCurrencies { .. })
        ));
    }

    #[test]
    fn test_empty_series_on_path() {
        let mut graph = RateGraph::default();
        graph.add_series(RateSeries::new(CurrencyPair::new("A", "B")));
        assert_eq!(
            graph.rate(&cur("A"), &cur("B"), t0()),
            Err(RateError::NoPriceData {
                pair: CurrencyPair::new("A", "B")
            })
        );
    }

    #[test]
    fn test_shortest_path_wins() {
        let mut graph = RateGraph::default();
        graph.add_series(series("XMR", "BTC", dec!(0.01)));
        graph.add_series(series("BTC", "USD", dec!(1200)));
        graph.add_series(series("USD", "EUR", dec!(0.9)));
        graph.add_series(series("BTC", "EUR", dec!(1000)));

        let path = graph.path(&cur("XMR"), &cur("EUR"), t0()).unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[1].series, 3);
        assert_eq!(graph.rate(&cur("XMR"), &cur("EUR"), t0()).unwrap(), dec!(10));
    }

    #[test]
    fn test_parallel_series_first_inserted_wins() {
        let mut graph = RateGraph::default();
        graph.add_series(series("BTC", "EUR", dec!(1000)));
        graph.add_series(series("EUR", "BTC", dec!(0.002)));

        let path = graph.path(&cur("EUR"), &cur("BTC"), t0()).unwrap();
        assert_eq!(
            path,
            vec![PathStep {
                series: 0,
                inverted: true
            }]
        );
        assert_eq!(graph.rate(&cur("EUR"), &cur("BTC"), t0()).unwrap(), dec!(0.001));
    }

    #[test]
    fn test_equal_length_routes_follow_insertion_order() {
        // A-B-D is inserted before A-C-D
        let mut graph = RateGraph::default();
        graph.add_series(series("A", "B", dec!(2)));
        graph.add_series(series("B", "D", dec!(3)));
        graph.add_series(series("A", "C", dec!(5)));
        graph.add_series(series("C", "D", dec!(7)));

        let path = graph.path(&cur("A"), &cur("D"), t0()).unwrap();
        let used: Vec<usize> = path.iter().map(|step| step.series).collect();
        assert_eq!(used, vec![0, 1]);
        assert_eq!(graph.rate(&cur("A"), &cur("D"), t0()).unwrap(), dec!(6));

        // A-C-D first this time
        let mut graph = RateGraph::default();
        graph.add_series(series("C", "D", dec!(7)));
        graph.add_series(series("A", "C", dec!(5)));
        graph.add_series(series("D", "B", dec!(0.5)));
        graph.add_series(series("A", "B", dec!(2)));

        let path = graph.path(&cur("A"), &cur("D"), t0()).unwrap();
        assert_eq!(
            path,
            vec![
                PathStep {
                    series: 1,
                    inverted: false
                },
                PathStep {
                    series: 0,
                    inverted: false
                },
            ]
        );
        assert_eq!(graph.rate(&cur("A"), &cur("D"), t0()).unwrap(), dec!(35));
    }

    #[test]
    fn test_covered_path_preferred_over_stale_shortcut() {
        let mut graph = RateGraph::default();
        let stale = RateSeries::with_samples(
            CurrencyPair::new("XMR", "EUR"),
            vec![(t0() - Duration::days(60), dec!(5))],
        )
        .unwrap();
        graph.add_series(stale);
        graph.add_series(series("XMR", "BTC", dec!(0.01)));
        graph.add_series(series("BTC", "EUR", dec!(1000)));

        assert_eq!(graph.rate(&cur("XMR"), &cur("EUR"), t0()).unwrap(), dec!(10));
        // far from any fresh data, only the direct edge is left
        let later = t0() + Duration::days(400);
        assert_eq!(graph.rate(&cur("XMR"), &cur("EUR"), later).unwrap(), dec!(5));
    }

    #[test]
    fn test_convert() {
        let mut graph = RateGraph::default();
        graph.add_series(series("BTC", "EUR", dec!(1000)));
        assert_eq!(
            graph
                .convert(dec!(0.25), &cur("BTC"), &cur("EUR"), t0())
                .unwrap(),
            dec!(250)
        );
        assert!(graph.contains(&cur("btc")));
        assert_eq!(graph.series_count(), 1);
    }
}
