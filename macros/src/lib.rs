use proc_macro::TokenStream;

use quote::quote;
use syn::{parse_macro_input, ItemFn};

/// Runs the function body on a fresh coroutine stack.
///
/// Expands to a call to `spool::runtime::start`, so the body may use
/// `spool::runtime::yield_now` and coroutine scratch allocations.
/// A panic inside the body is re-raised once the coroutine has finished.
#[proc_macro_attribute]
pub fn start(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);

    let attributes = &item.attrs;
    let visibility = &item.vis;
    let signature = &item.sig;
    let body = &item.block;

    let result = quote! {
        #(#attributes)*
        #visibility #signature {
            match ::spool::runtime::start(move || #body) {
                Ok(output) => output,
                Err(payload) => ::std::panic::resume_unwind(payload),
            }
        }
    };

    result.into()
}
