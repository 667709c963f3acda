fn main() {
    elg_host_lib::run()
}
