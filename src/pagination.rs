//! Paged list traversal.
//!
//! A list endpoint implements [`Pageable`]. Callers then either visit items
//! until a predicate holds with [`loop_until`], or consume every item in order
//! from a background producer with [`as_stream`].
//!
//! [`ListPageable`] covers endpoints answering with the Engine's list envelope
//! `{"page", "limit", "total_pages", "total_items", "data": [...]}`.

use crate::{metadata::RequestMetadata, Client, Error, Result};
use async_trait::async_trait;
use futures::Stream;
use http::Method;
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Page size used by [`loop_until`].
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// A composable setter for list query parameters.
///
/// Options are applied in order, so a later option overrides an earlier one
/// setting the same key.
///
/// # Examples
///
/// ```
/// use anxcloud::pagination::{apply_all, QueryParam};
///
/// let options = vec![
///     QueryParam::pair("search", "web"),
///     QueryParam::new(|query| {
///         query.insert("sort".to_string(), "name".to_string());
///     }),
/// ];
///
/// let query = apply_all(&options);
/// assert_eq!(query["search"], "web");
/// assert_eq!(query["sort"], "name");
/// ```
#[derive(Clone)]
pub struct QueryParam(Arc<dyn Fn(&mut HashMap<String, String>) + Send + Sync>);

impl QueryParam {
    /// Wraps an arbitrary setter.
    pub fn new<F>(setter: F) -> Self
    where
        F: Fn(&mut HashMap<String, String>) + Send + Sync + 'static,
    {
        Self(Arc::new(setter))
    }

    /// Sets `key` to `value`.
    pub fn pair(key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        Self::new(move |query| {
            query.insert(key.clone(), value.clone());
        })
    }

    /// Applies this option to `query`.
    pub fn apply(&self, query: &mut HashMap<String, String>) {
        (self.0)(query)
    }
}

impl fmt::Debug for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueryParam(..)")
    }
}

/// Folds `options`, in order, into a fresh query map.
pub fn apply_all(options: &[QueryParam]) -> HashMap<String, String> {
    let mut query = HashMap::new();
    for option in options {
        option.apply(&mut query);
    }
    query
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    num: u32,
    size: u32,
    total: u32,
    content: Vec<T>,
    options: Vec<QueryParam>,
}

impl<T> Page<T> {
    /// Creates a page.
    ///
    /// `num` is 1-based and `total` is the number of pages the API reported,
    /// or `0` if it did not report one.
    pub fn new(num: u32, size: u32, total: u32, content: Vec<T>, options: Vec<QueryParam>) -> Self {
        Self {
            num,
            size,
            total,
            content,
            options,
        }
    }

    /// The 1-based page number.
    pub fn num(&self) -> u32 {
        self.num
    }

    /// The requested page size.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The total number of pages; `0` when unknown.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// The items on this page.
    pub fn content(&self) -> &[T] {
        &self.content
    }

    /// The options replayed on every following page request.
    pub fn options(&self) -> &[QueryParam] {
        &self.options
    }

    /// Returns `true` if no page follows this one.
    ///
    /// With an unknown total, a page shorter than the page size is the last.
    pub fn is_last(&self) -> bool {
        if self.content.is_empty() {
            return true;
        }
        if self.total == 0 {
            return self.content.len() < self.size as usize;
        }
        self.num >= self.total
    }

    /// Consumes the page, returning its items.
    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    /// Maps every item, keeping the page position and options.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            num: self.num,
            size: self.size,
            total: self.total,
            content: self.content.into_iter().map(f).collect(),
            options: self.options,
        }
    }

    fn take_content(&mut self) -> Vec<T> {
        std::mem::take(&mut self.content)
    }
}

/// A listing that can be fetched page by page.
#[async_trait]
pub trait Pageable: Send + Sync {
    /// The listed item.
    type Item: Send + Sync;

    /// Fetches page `page` (1-based) of `limit` items, applying `options`.
    ///
    /// The returned page must carry `options` so they can be replayed.
    async fn get_page(
        &self,
        page: u32,
        limit: u32,
        options: &[QueryParam],
    ) -> Result<Page<Self::Item>>;

    /// Fetches the page after `prior`.
    ///
    /// Requests `prior.num() + 1` with the same size and options. During
    /// [`as_stream`] the items of `prior` have already been handed out, so
    /// implementations must not rely on its content.
    async fn next_page(&self, prior: &Page<Self::Item>) -> Result<Page<Self::Item>> {
        self.get_page(prior.num() + 1, prior.size(), prior.options())
            .await
    }
}

/// Visits items in order until `predicate` returns `Ok(true)`.
///
/// Uses [`DEFAULT_PAGE_SIZE`] and no options; see [`loop_until_with`].
pub async fn loop_until<P, F, E>(pageable: &P, predicate: F) -> std::result::Result<(), E>
where
    P: Pageable + ?Sized,
    F: FnMut(&P::Item) -> std::result::Result<bool, E>,
    E: From<Error>,
{
    loop_until_with(pageable, DEFAULT_PAGE_SIZE, &[], predicate).await
}

/// Visits items in order until `predicate` returns `Ok(true)`.
///
/// Pages are fetched one at a time, starting at page 1, and only once every
/// item of the previous page was visited. A predicate error stops the
/// traversal and is returned as-is, as is any error fetching a page.
///
/// # Errors
///
/// Returns [`Error::ConditionNeverMet`] (converted into `E`) if every item was
/// visited without the predicate succeeding.
///
/// # Examples
///
/// ```no_run
/// use anxcloud::{Client, Error};
/// use anxcloud::pagination::{loop_until_with, ListPageable, QueryParam};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Vlan { identifier: String, name: String }
///
/// # async fn example(client: Client) -> Result<(), Error> {
/// let vlans = ListPageable::<Vlan>::new(client, "/api/vlan/v1/vlan.json");
///
/// let mut found = None;
/// let result = loop_until_with(&vlans, 50, &[QueryParam::pair("search", "prod")], |vlan| {
///     if vlan.name == "prod-backend" {
///         found = Some(vlan.identifier.clone());
///         return Ok(true);
///     }
///     Ok::<_, Error>(false)
/// })
/// .await;
///
/// match result {
///     Ok(()) => println!("found {:?}", found),
///     Err(e) if e.is_condition_never_met() => println!("no such VLAN"),
///     Err(e) => return Err(e),
/// }
/// # Ok(())
/// # }
/// ```
pub async fn loop_until_with<P, F, E>(
    pageable: &P,
    limit: u32,
    options: &[QueryParam],
    mut predicate: F,
) -> std::result::Result<(), E>
where
    P: Pageable + ?Sized,
    F: FnMut(&P::Item) -> std::result::Result<bool, E>,
    E: From<Error>,
{
    let mut page = pageable.get_page(1, limit, options).await?;
    loop {
        for item in page.content() {
            if predicate(item)? {
                return Ok(());
            }
        }
        if page.is_last() {
            return Err(Error::ConditionNeverMet.into());
        }
        tracing::debug!(page = page.num() + 1, "Fetching next page");
        page = pageable.next_page(&page).await?;
    }
}

/// Streams every item of a listing from a background task.
///
/// Items arrive strictly in order. The channel holds one item, and the next
/// page is fetched only once the consumer has taken every item of the
/// previous one. An error fetching a page is delivered as the final item.
///
/// Cancelling through the returned [`CancelHandle`], or dropping the stream,
/// stops the producer: no further item is yielded and no further page is
/// requested.
///
/// Must be called within a Tokio runtime.
pub fn as_stream<P>(
    pageable: Arc<P>,
    limit: u32,
    options: Vec<QueryParam>,
) -> (PageStream<P::Item>, CancelHandle)
where
    P: Pageable + ?Sized + 'static,
    P::Item: 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let token = CancellationToken::new();

    tokio::spawn(produce(pageable, limit, options, tx, token.clone()));

    (
        PageStream {
            rx,
            token: token.clone(),
        },
        CancelHandle { token },
    )
}

async fn produce<P>(
    pageable: Arc<P>,
    limit: u32,
    options: Vec<QueryParam>,
    tx: mpsc::Sender<Result<P::Item>>,
    token: CancellationToken,
) where
    P: Pageable + ?Sized,
{
    let mut next = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        fetched = pageable.get_page(1, limit, &options) => fetched,
    };
    // Slot reserved before a page fetch, used for its first item.
    let mut reserved = None;

    loop {
        let mut page = match next {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, "Page fetch failed, ending stream");
                let slot = match reserved.take() {
                    Some(slot) => Some(slot),
                    None => reserve(&tx, &token).await,
                };
                if let Some(slot) = slot {
                    slot.send(Err(e));
                }
                return;
            }
        };

        let last = page.is_last();
        for item in page.take_content() {
            let slot = match reserved.take() {
                Some(slot) => slot,
                None => match reserve(&tx, &token).await {
                    Some(slot) => slot,
                    None => return,
                },
            };
            slot.send(Ok(item));
        }
        if last {
            return;
        }

        // The slot frees up only once the consumer took the previous item.
        reserved = match reserve(&tx, &token).await {
            Some(slot) => Some(slot),
            None => return,
        };
        next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            fetched = pageable.next_page(&page) => fetched,
        };
    }
}

/// Waits for a free channel slot. `None` once cancelled or the stream is gone.
async fn reserve<'a, T>(
    tx: &'a mpsc::Sender<T>,
    token: &CancellationToken,
) -> Option<mpsc::Permit<'a, T>> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        slot = tx.reserve() => slot.ok(),
    }
}

/// Items of a listing produced by [`as_stream`].
///
/// Use [`PageStream::next`] directly or any `futures::StreamExt` combinator.
#[derive(Debug)]
pub struct PageStream<T> {
    rx: mpsc::Receiver<Result<T>>,
    token: CancellationToken,
}

impl<T> PageStream<T> {
    /// Waits for the next item. `None` once the listing is exhausted or cancelled.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if !self.token.is_cancelled() {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {}
                item = self.rx.recv() => return item,
            }
        }
        self.rx.close();
        None
    }

    /// Stops the producer.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl<T> Unpin for PageStream<T> {}

impl<T> Stream for PageStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            this.rx.close();
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl<T> Drop for PageStream<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Stops a [`PageStream`] from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Stops the producer. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A [`Pageable`] over an Engine list endpoint.
///
/// Requests `GET <path>?page=<n>&limit=<size>` plus the options, and decodes
/// the list envelope.
pub struct ListPageable<T> {
    client: Client,
    path: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> ListPageable<T> {
    /// Lists `path`, relative to the client's base URL.
    pub fn new(client: Client, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            _item: PhantomData,
        }
    }

    /// The listed path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<T> fmt::Debug for ListPageable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListPageable")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ListEnvelope<T> {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    total_items: u64,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[async_trait]
impl<T> Pageable for ListPageable<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    type Item = T;

    async fn get_page(&self, page: u32, limit: u32, options: &[QueryParam]) -> Result<Page<T>> {
        // page and limit win over options setting the same keys
        let metadata = RequestMetadata::new(Method::GET, self.path.clone())
            .with_options(options)
            .with_query_param("page", page.to_string())
            .with_query_param("limit", limit.to_string());

        let envelope = self
            .client
            .call::<(), ListEnvelope<T>>(metadata, None)
            .await?
            .data;

        tracing::debug!(
            path = %self.path,
            page,
            total_pages = envelope.total_pages,
            total_items = envelope.total_items,
            "Fetched list page"
        );
        if envelope.page != 0 && envelope.page != page {
            tracing::warn!(
                path = %self.path,
                requested = page,
                answered = envelope.page,
                "List page number differs from the requested one"
            );
        }

        Ok(Page::new(
            page,
            if envelope.limit == 0 { limit } else { envelope.limit },
            envelope.total_pages,
            envelope.data,
            options.to_vec(),
        ))
    }
}
